//! rulebot: command-line front end for direct-rule requests.

use clap::{Parser, Subcommand};
use rulebot::{
    AppendOutcome, Config, Coverage, Domain, FileStore, Lookup, Recommendation, RuleService,
    RuleStore,
};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "rulebot")]
#[command(author = "Rule-Bot")]
#[command(version)]
#[command(about = "Check domains and add direct rules to a hosted Clash rule file", long_about = None)]
struct Cli {
    /// YAML configuration file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use a local rule file instead of the GitHub repository
    #[arg(long, global = true)]
    local_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether a domain is direct, without recommending anything
    Query {
        /// Domain, URL, or any text containing one
        text: String,
    },

    /// Recommend whether a domain should be added
    Decide {
        /// Domain, URL, or any text containing one
        text: String,
    },

    /// Decide and, if warranted, append the domain to the rule file
    Add {
        /// Domain, URL, or any text containing one
        text: String,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Credit this user in the commit message
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Download all rule sources and print a summary
    Refresh,

    /// Answer requests read from stdin, one per line, keeping the rule
    /// corpus refreshed in the background
    Serve {
        /// Append domains that should be added without asking
        #[arg(long)]
        add: bool,

        /// Credit this user in commit messages
        #[arg(short, long)]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str()))
        .init();

    match run(cli, config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn build_store(config: &Config, local_file: Option<&Path>) -> rulebot::Result<Arc<dyn RuleStore>> {
    match local_file {
        Some(path) => Ok(Arc::new(FileStore::new(path))),
        None => Ok(Arc::new(RuleService::github_store(config)?)),
    }
}

/// Run a command, returning the process exit code.
async fn run(cli: Cli, config: Config) -> Result<i32, Box<dyn std::error::Error>> {
    let store = build_store(&config, cli.local_file.as_deref())?;
    let service = RuleService::from_config(&config, store)?;

    if let Commands::Refresh = cli.command {
        let corpus = service.cache().refresh().await?;
        println!(
            "Rule corpus refreshed: {} direct suffixes, {} CN domains, {} CN IP ranges",
            corpus.direct_count(),
            corpus.cn_domain_count(),
            corpus.cn_range_count()
        );
        return Ok(0);
    }

    service.init().await;

    match cli.command {
        Commands::Query { text } => {
            let (domain, lookup) = service.lookup(&text).await?;
            match lookup {
                Lookup::PolicyDirect => println!("{}: direct (.{} domains are always direct)", domain, domain.tld()),
                Lookup::AlreadyDirect(Coverage::DirectList(rule)) => {
                    println!("{}: direct (rule file has {})", domain, rule)
                }
                Lookup::AlreadyDirect(Coverage::CnList(entry)) => {
                    println!("{}: direct (CN domain list has {})", domain, entry)
                }
                Lookup::Classified(geo) => println!("{}: not in any list; {}", domain, geo),
            }
            Ok(0)
        }
        Commands::Decide { text } => {
            let rec = service.decide(&text).await?;
            println!("{}", rec);
            Ok(if rec.should_add() { 0 } else { 2 })
        }
        Commands::Add { text, yes, user } => {
            let rec = service.decide(&text).await?;
            println!("{}", rec);
            let domain = match &rec {
                Recommendation::AddDirect { domain, .. } => domain.clone(),
                Recommendation::AlreadyDirect { .. } | Recommendation::PolicyDirect { .. } => return Ok(0),
                _ => return Ok(2),
            };

            if !yes && !confirm(&format!("Add DOMAIN-SUFFIX,{},direct?", domain))? {
                println!("Cancelled");
                return Ok(1);
            }

            append(&service, &domain, user.as_deref()).await
        }
        Commands::Serve { add, user } => {
            let _refresh = service.cache().clone().spawn_refresh_loop();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let rec = match service.decide(&line).await {
                    Ok(rec) => rec,
                    Err(e) => {
                        println!("{}: {}", line.trim(), e);
                        continue;
                    }
                };
                println!("{}", rec);
                if let (true, Recommendation::AddDirect { domain, .. }) = (add, &rec) {
                    if let Err(e) = append(&service, domain, user.as_deref()).await {
                        println!("Failed to add {}: {}", domain, e);
                    }
                }
            }
            Ok(0)
        }
        Commands::Refresh => Ok(0),
    }
}

/// Append `domain` and report the outcome, returning the exit code.
async fn append(
    service: &RuleService,
    domain: &Domain,
    user: Option<&str>,
) -> Result<i32, Box<dyn std::error::Error>> {
    match service.append_rule(domain, user).await? {
        AppendOutcome::Committed { duplicate: true, .. } => {
            println!("{} was already in the rule file", domain);
        }
        AppendOutcome::Committed { commit_url, .. } => match commit_url {
            Some(url) => println!("Added {} ({})", domain, url),
            None => println!("Added {}", domain),
        },
        AppendOutcome::Conflict { attempts } => {
            println!(
                "The rule file kept changing; gave up after {} attempts. Try again later.",
                attempts
            );
            return Ok(3);
        }
    }
    Ok(0)
}

fn confirm(prompt: &str) -> std::io::Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
