//! Traces boot-time file access and builds a page-cache prefetch pack.

use std::env;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use tracepack::config::SessionConfig;
use tracepack::error::TraceError;
use tracepack::session;

fn print_usage() {
    println!("Usage:");
    println!(" tracepack [OPTIONS] [PATH]");
    println!();
    println!("Traces file access during the observation window and writes a");
    println!("prefetch pack for each device touched.");
    println!();
    println!("  --daemon                      fork and exit the parent once armed");
    println!("  --timeout SECONDS             stop after SECONDS instead of waiting for a signal");
    println!("  --force-ssd-mode              treat every device as non-rotational");
    println!("  --use-existing-trace-events   assume trace events are already enabled");
    println!("  --path-prefix PREFIX          rewrite paths under PREFIX's device");
    println!("  --path-prefix-filter PREFIX   only keep paths starting with PREFIX");
    println!("  --pack-file PATH              write a single pack to PATH instead of per-device");
}

fn die(message: impl std::fmt::Display) -> ! {
    eprintln!("tracepack: {message}");
    exit(1);
}

struct Args {
    config: SessionConfig,
    pack_file: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut config = SessionConfig::default();
    let mut pack_file = None;
    let mut positional: Option<String> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--daemon" => config.daemonise = true,
            "--force-ssd-mode" => config.force_ssd_mode = true,
            "--use-existing-trace-events" => config.use_existing_trace_events = true,
            "--timeout" => {
                let seconds: u64 = args
                    .next()
                    .unwrap_or_else(|| die("--timeout requires an argument"))
                    .parse()
                    .unwrap_or_else(|_| die("--timeout expects an integer number of seconds"));
                config.timeout = Some(Duration::from_secs(seconds));
            }
            "--path-prefix-filter" => {
                config.path_prefix_filter = Some(
                    args.next()
                        .unwrap_or_else(|| die("--path-prefix-filter requires an argument")),
                );
            }
            "--path-prefix" => {
                let prefix = args
                    .next()
                    .unwrap_or_else(|| die("--path-prefix requires an argument"));
                let meta = std::fs::symlink_metadata(&prefix).unwrap_or_else(|e| {
                    die(format_args!("illegal argument to --path-prefix: {e}"))
                });
                if !meta.is_dir() {
                    die(format_args!("--path-prefix {prefix}: not a directory"));
                }
                config.path_prefix_rewrite = Some((PathBuf::from(&prefix), meta.dev()));
            }
            "--pack-file" => {
                pack_file = Some(PathBuf::from(
                    args.next()
                        .unwrap_or_else(|| die("--pack-file requires an argument")),
                ));
            }
            "--help" => {
                print_usage();
                exit(0);
            }
            other if other.starts_with('-') => {
                print_usage();
                die(format_args!("unrecognized option {other}"));
            }
            other => {
                if positional.replace(other.to_string()).is_some() {
                    print_usage();
                    die("too many positional arguments");
                }
            }
        }
    }

    let _ = positional;
    Args { config, pack_file }
}

fn exit_code_for(err: &TraceError) -> i32 {
    match err {
        TraceError::RequiredEvent(..) => 2,
        TraceError::BufferSize(_) => 3,
        TraceError::TracingToggle(_) => 4,
        TraceError::Fork(_) => 5,
        TraceError::OpenTrace(_) => 6,
    }
}

fn main() {
    env_logger::init();

    let args = parse_args();
    if let Some(pack_file) = &args.pack_file {
        log::debug!("packs will be written relative to {}", pack_file.display());
    }

    let packs = session::run(&args.config).unwrap_or_else(|err| {
        log::error!("{err}");
        exit(exit_code_for(&err));
    });

    for pack in &packs {
        println!(
            "dev {:x}: {} paths, {} blocks, rotational={}",
            pack.dev,
            pack.paths.len(),
            pack.blocks.len(),
            pack.rotational
        );
    }
}
