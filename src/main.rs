#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;
use structopt::clap;

extern crate simplelog;
use simplelog::{Config, LevelFilter, WriteLogger};

use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indicatif::{ProgressBar, ProgressStyle};

use stm32_uart_loader::linux::LinuxSession;
use stm32_uart_loader::{Operation, Options, Outcome, Protection};

const ACTIONS: &str = "ACTIONS:
    One or more actions may follow the global options, and are run in order
    against a single bootloader connection, stopping at the first failure.
    Use `<action> --help` for the options of each action.

    info          Show device information
    status        Show bootloader version and read protection status
    read          Read device memory
    write         Write device memory
    erase         Erase flash pages, or all flash
    execute       Start execution at the provided address
    protection    Change read / write protection";

#[derive(Clone, Debug, StructOpt)]
#[structopt(after_help = ACTIONS)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Action {
    /// Show device information
    Info,

    /// Show bootloader version and read protection status
    Status,

    /// Read device memory
    Read {
        /// Start address
        #[structopt(long, default_value = "0x0800_0000", parse(try_from_str = parse_int))]
        address: u32,

        /// Number of bytes to read (eg. 1024, 0x400, 64K, 64KiB)
        #[structopt(long, default_value = "64K", parse(try_from_str = parse_size))]
        size: usize,

        /// Output file, '-' for stdout
        #[structopt(long, default_value = "-")]
        file: PathBuf,

        /// Show progress
        #[structopt(long)]
        progress: bool,
    },

    /// Write device memory
    Write {
        /// Start address
        #[structopt(long, default_value = "0x0800_0000", parse(try_from_str = parse_int))]
        address: u32,

        /// Input file, '-' for stdin
        #[structopt(long, default_value = "-")]
        file: PathBuf,

        /// Show progress
        #[structopt(long)]
        progress: bool,

        /// Read back and compare written data
        #[structopt(long)]
        verify: bool,
    },

    /// Erase flash pages, or all flash if no pages are specified
    Erase {
        /// Pages (or page ranges) to erase, eg. 0,4-7
        #[structopt(long)]
        pages: Option<Pages>,
    },

    /// Start execution at the provided address
    Execute {
        #[structopt(long, default_value = "0x0800_0000", parse(try_from_str = parse_int))]
        address: u32,
    },

    /// Change read / write protection
    Protection {
        #[structopt(long)]
        protect_read: bool,

        #[structopt(long)]
        unprotect_read: bool,

        #[structopt(long)]
        protect_write: bool,

        #[structopt(long)]
        unprotect_write: bool,
    },
}

const ACTION_NAMES: &[&str] = &["info", "status", "read", "write", "erase", "execute", "protection"];

/// Options that do not consume the following argument
const FLAGS: &[&str] = &[
    "-h", "--help", "-V", "--version", "--no-reset", "--skip-init", "--progress", "--verify",
    "--protect-read", "--unprotect-read", "--protect-write", "--unprotect-write",
];

/// Split arguments into global options followed by a list of actions.
///
/// An action starts at each action name that is not the value of a preceding option.
fn split_actions(args: &[String]) -> (Vec<String>, Vec<Vec<String>>) {
    let mut global = vec![];
    let mut actions: Vec<Vec<String>> = vec![];

    for (i, a) in args.iter().enumerate() {
        let is_value = i > 0 && {
            let prev = &args[i - 1];
            prev.starts_with('-') && !prev.contains('=') && !FLAGS.contains(&prev.as_str())
        };

        if ACTION_NAMES.contains(&a.as_str()) && !is_value {
            actions.push(vec![a.clone()]);
        } else if let Some(current) = actions.last_mut() {
            current.push(a.clone());
        } else {
            global.push(a.clone());
        }
    }

    (global, actions)
}

/// Parse global options and the queue of actions
fn parse_args(argv: &[String]) -> Result<(Args, Vec<Action>), clap::Error> {
    let (bin, rest) = match argv.split_first() {
        Some((bin, rest)) => (bin.as_str(), rest),
        None => ("stm32-uart-loader", &[][..]),
    };

    let (global, actions) = split_actions(rest);

    let args = Args::from_iter_safe(std::iter::once(bin.to_string()).chain(global))?;

    if actions.is_empty() {
        return Err(clap::Error::with_description(
            "no action specified, see --help for available actions",
            clap::ErrorKind::MissingRequiredArgument,
        ));
    }

    let actions = actions.into_iter()
        .map(|a| Action::from_iter_safe(std::iter::once(bin.to_string()).chain(a)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((args, actions))
}

/// Sorted list of flash pages
#[derive(Clone, Debug, PartialEq)]
pub struct Pages(Vec<u8>);

impl FromStr for Pages {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pages = vec![];

        for segment in s.split(',').filter(|s| !s.is_empty()) {
            let mut parts = segment.splitn(2, '-');
            let start = parse_page(parts.next().unwrap_or_default())?;
            let end = match parts.next() {
                Some(e) => parse_page(e)?,
                None => start,
            };
            pages.extend(start..=end);
        }

        pages.sort();

        Ok(Pages(pages))
    }
}

fn parse_page(s: &str) -> Result<u8, String> {
    s.trim().parse::<u8>().map_err(|e| format!("invalid page '{}': {}", s, e))
}

/// Parse an integer, supporting hex (0x), underscores and a K (x1024) suffix
fn parse_int(s: &str) -> Result<u32, String> {
    let v = s.replace('_', "");

    if let Some(k) = v.strip_suffix('K') {
        return parse_int(k)?.checked_mul(1024).ok_or_else(|| format!("value '{}' too large", s));
    }

    match v.strip_prefix("0x") {
        Some(h) => u32::from_str_radix(h, 16),
        None => v.parse::<u32>(),
    }.map_err(|e| format!("invalid value '{}': {}", s, e))
}

/// Parse a size as an integer or with byte units
fn parse_size(s: &str) -> Result<usize, String> {
    if let Ok(v) = parse_int(s) {
        return Ok(v as usize);
    }

    bytefmt::parse(s)
        .map(|v| v as usize)
        .map_err(|e| format!("invalid size '{}': {}", s, e))
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let argv: Vec<String> = std::env::args().collect();
    let (o, actions) = match parse_args(&argv) {
        Ok(v) => v,
        Err(e) => e.exit(),
    };

    // Configure logger, stdout is reserved for data
    let _ = WriteLogger::init(o.log_level, Config::default(), std::io::stderr());

    info!("Connecting to bootloader on {}", o.port);

    let mut s = LinuxSession::linux(&o.port, o.baud, o.options.clone())?;

    info!("Bootloader connected!");

    // Remaining actions are abandoned on the first failure
    for action in &actions {
        debug!("Running action: {:?}", action);
        run_action(&mut s, action)?;
    }

    Ok(())
}

fn run_action(s: &mut LinuxSession, action: &Action) -> anyhow::Result<()> {
    match action {
        Action::Info => {
            if let Outcome::Info(i) = s.run(Operation::Info, None)? {
                println!("version: 0x{:02x}", i.version);
                println!("chip id: 0x{:04x}", i.chip_id);
                println!("unique id: {}", hex::encode(&i.unique_id));
                println!("flash size: {}", bytefmt::format(i.flash_size as u64));
            }
        },
        Action::Status => {
            if let Outcome::Status(p) = s.run(Operation::ProtectionStatus, None)? {
                println!("version: 0x{:02x}", p.version);
                println!("status: 0x{:02x}", p.status);
                println!("counter: 0x{:02x}", p.counter);
            }
        },
        Action::Read{ address, size, file, progress } => {
            let op = Operation::Read{ address: *address, size: *size };

            if let Outcome::Data(d) = with_progress(s, op, "Reading", *progress)? {
                save(file, &d)?;
            }
        },
        Action::Write{ address, file, progress, verify } => {
            let data = load(file)?;
            info!("Writing {} to 0x{:08x}", bytefmt::format(data.len() as u64), address);

            with_progress(s, Operation::Write{ address: *address, data: &data }, "Writing", *progress)?;

            if *verify {
                with_progress(s, Operation::Verify{ address: *address, data: &data }, "Verifying", *progress)?;
                info!("Verified!");
            }
        },
        Action::Erase{ pages } => {
            let pages = pages.as_ref().map(|p| &p.0[..]);
            s.run(Operation::Erase(pages), None)?;
        },
        Action::Execute{ address } => {
            info!("Starting execution at 0x{:08x}", address);
            s.run(Operation::Execute(*address), None)?;
        },
        Action::Protection{ protect_read, unprotect_read, protect_write, unprotect_write } => {
            let changes = [
                (*protect_read, Protection::ProtectRead),
                (*unprotect_read, Protection::UnprotectRead),
                (*protect_write, Protection::ProtectWrite),
                (*unprotect_write, Protection::UnprotectWrite),
            ];

            for (_, p) in changes.iter().filter(|(enabled, _)| *enabled) {
                info!("Applying {:?}", p);
                s.run(Operation::Protection(*p), None)?;
            }
        },
    }

    Ok(())
}

/// Run an operation, displaying a progress bar if enabled
fn with_progress(s: &mut LinuxSession, op: Operation, msg: &str, show: bool) -> anyhow::Result<Outcome> {
    if !show {
        return Ok(s.run(op, None)?);
    }

    let pb = ProgressBar::new(0);
    pb.set_style(ProgressStyle::default_bar()
        .template("{msg} [{bar:40}] {bytes}/{total_bytes} ({eta})"));
    pb.set_message(msg);

    let mut cb = |done: usize, total: usize| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    };

    let r = s.run(op, Some(&mut cb));
    pb.finish();

    Ok(r?)
}

fn load(file: &Path) -> anyhow::Result<Vec<u8>> {
    if file == Path::new("-") {
        let mut d = vec![];
        std::io::stdin().read_to_end(&mut d)?;
        Ok(d)
    } else {
        Ok(std::fs::read(file)?)
    }
}

fn save(file: &Path, data: &[u8]) -> anyhow::Result<()> {
    if file == Path::new("-") {
        let mut out = std::io::stdout();
        out.write_all(data)?;
        out.flush()?;
    } else {
        std::fs::write(file, data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ints() {
        assert_eq!(parse_int("0x0800_0000"), Ok(0x0800_0000));
        assert_eq!(parse_int("1024"), Ok(1024));
        assert_eq!(parse_int("64K"), Ok(64 * 1024));
        assert_eq!(parse_int("0x10K"), Ok(16 * 1024));
        assert!(parse_int("nope").is_err());
    }

    #[test]
    fn parse_sizes() {
        assert_eq!(parse_size("0x100"), Ok(256));
        assert_eq!(parse_size("64K"), Ok(64 * 1024));
        assert!(parse_size("lots").is_err());
    }

    fn argv(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn parse_action_queue() {
        let (args, actions) = parse_args(&argv(
            "stm32-uart-loader --port /dev/ttyACM0 --no-reset erase --pages 0-1 write --file fw.bin --verify execute"
        )).unwrap();

        assert_eq!(args.port, "/dev/ttyACM0");
        assert!(args.options.no_reset);
        assert_eq!(actions.len(), 3);

        assert!(matches!(&actions[0], Action::Erase{ pages: Some(p) } if p == &Pages(vec![0, 1])));
        assert!(matches!(&actions[1], Action::Write{ address: 0x0800_0000, file, verify: true, .. } if file == Path::new("fw.bin")));
        assert!(matches!(&actions[2], Action::Execute{ address: 0x0800_0000 }));
    }

    #[test]
    fn parse_action_name_as_value() {
        let (_, actions) = parse_args(&argv("stm32-uart-loader read --file info --size 1K info")).unwrap();

        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], Action::Read{ size: 1024, file, .. } if file == Path::new("info")));
        assert!(matches!(&actions[1], Action::Info));
    }

    #[test]
    fn parse_requires_action() {
        assert!(parse_args(&argv("stm32-uart-loader --port /dev/ttyUSB1")).is_err());
        assert!(parse_args(&argv("stm32-uart-loader info --bogus")).is_err());
    }

    #[test]
    fn parse_pages() {
        assert_eq!("0,4-6,2".parse::<Pages>(), Ok(Pages(vec![0, 2, 4, 5, 6])));
        assert_eq!("3".parse::<Pages>(), Ok(Pages(vec![3])));
        assert!("0-256".parse::<Pages>().is_err());
        assert!("a".parse::<Pages>().is_err());
    }
}
