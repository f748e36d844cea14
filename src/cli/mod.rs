mod serve;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::terminal::{self, GuideSection};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("serve", "Start the batch daemon and HTTP API")
        .print();

    GuideSection::new("Diagnostics")
        .command("help", "Show this help")
        .print();

    println!(
        "\n {} {} <command> [--config <path>] [--api-host <host>] [--api-port <port>]\n",
        style("Usage:").bold(),
        style("batchline").green()
    );
}

#[derive(Debug, Default)]
pub(crate) struct ServeFlags {
    pub config: Option<PathBuf>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
}

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> ServeFlags {
    let mut flags = ServeFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    flags.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    flags.api_host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-port" => {
                if i + 1 < args.len() {
                    flags.api_port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    flags
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        None | Some("serve") => serve::run(parse_serve_flags(&args, 1)).await,
        Some("help") | Some("--help") | Some("-h") => {
            print_help();
            Ok(())
        }
        Some(other) => {
            terminal::print_error(&format!("Unknown command: {}", other));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn serve_flags_parse_in_any_order() {
        let flags = parse_serve_flags(
            &argv(&[
                "batchline",
                "serve",
                "--api-port",
                "18080",
                "--config",
                "/etc/batchline.toml",
                "--api-host",
                "0.0.0.0",
            ]),
            2,
        );
        assert_eq!(flags.api_port, Some(18080));
        assert_eq!(flags.api_host.as_deref(), Some("0.0.0.0"));
        assert_eq!(
            flags.config,
            Some(PathBuf::from("/etc/batchline.toml"))
        );
    }

    #[test]
    fn unknown_and_dangling_flags_are_ignored() {
        let flags = parse_serve_flags(&argv(&["batchline", "serve", "--wat", "--api-port"]), 2);
        assert_eq!(flags.api_port, None);
        assert_eq!(flags.api_host, None);
        assert_eq!(flags.config, None);
    }

    #[test]
    fn bad_port_value_is_ignored() {
        let flags = parse_serve_flags(&argv(&["batchline", "serve", "--api-port", "lots"]), 2);
        assert_eq!(flags.api_port, None);
    }
}
