//! Command-line flags. Anything not given here comes from the config file
//! and environment.

use std::path::PathBuf;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
}

fn usage(prog: &str) -> String {
    format!("Usage: {prog} [--port PORT|-p PORT] [--config FILE|-c FILE]")
}

/// `Err` carries the text to print: usage for `--help`, or a complaint.
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "llamactl_agent".into());
    let mut long: Option<String> = None;
    let mut short: Option<String> = None;
    let mut config: Option<PathBuf> = None;

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => return Err(usage(&prog)),
            "--port" => long = it.next(),
            "-p" => short = it.next(),
            "--config" | "-c" => config = it.next().map(PathBuf::from),
            _ if arg.starts_with("--port=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    long = Some(v.to_string());
                }
            }
            _ if arg.starts_with("--config=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        config = Some(PathBuf::from(v));
                    }
                }
            }
            _ => return Err(format!("Unexpected argument {arg:?}. {}", usage(&prog))),
        }
    }

    let port = match long.or(short) {
        Some(s) => Some(
            s.parse::<u16>()
                .map_err(|_| format!("invalid port {s:?}. {}", usage(&prog)))?,
        ),
        None => None,
    };
    Ok(ParsedArgs { port, config })
}
