//! CLI entry point: run one research invocation and print the result JSON.
//!
//! Usage:
//!   forage "<query>" [--intent commerce|informational|navigation|site_search]
//!          [--mode standard|deep] [--session <id>] [--goal "<goal>"]
//!          [--force-refresh]

use forage::{load_core_config, Intent, ResearchCore, ResearchRequest};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!(
        "usage: forage \"<query>\" [--intent commerce|informational|navigation|site_search]\n\
         \x20             [--mode standard|deep] [--session <id>] [--goal \"<goal>\"] [--force-refresh]"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("forage=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(query) = args.first().filter(|a| !a.starts_with("--")).cloned() else {
        print_usage();
        std::process::exit(2);
    };

    let mut request = ResearchRequest::new(query, "cli-session", Intent::Informational);
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--intent" => {
                if let Some(v) = iter.next() {
                    request.intent = Intent::parse(v);
                }
            }
            "--mode" => {
                if let Some(v) = iter.next() {
                    request.mode = if v.eq_ignore_ascii_case("deep") {
                        forage::ResearchMode::Deep
                    } else {
                        forage::ResearchMode::Standard
                    };
                }
            }
            "--session" => {
                if let Some(v) = iter.next() {
                    request.session_id = v.clone();
                }
            }
            "--goal" => {
                if let Some(v) = iter.next() {
                    request.goal = v.clone();
                }
            }
            "--force-refresh" => request.force_refresh = true,
            other => {
                eprintln!("unknown argument: {}", other);
                print_usage();
                std::process::exit(2);
            }
        }
    }

    let config = load_core_config();
    let core = ResearchCore::builder(config).build()?;

    match core.research(&request).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("research failed: {}", e);
            std::process::exit(1);
        }
    }
}
