use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use clap::Args;
use std::collections::BTreeMap;
use std::path::PathBuf;

use arena_core::rpc::protocol::{MatchPlayerSpec, RequestMatchRequest, SubmitChampionRequest};

use super::{load_config, master_client};

/// Arguments for the submit-champion subcommand
#[derive(Args)]
pub struct SubmitChampionArgs {
    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Owner of the champion
    #[arg(long)]
    pub user: String,

    /// Display name of the champion
    #[arg(long)]
    pub name: String,

    /// Champion source archive (tar.gz)
    pub sources: PathBuf,
}

/// Arguments for the request-match subcommand
#[derive(Args)]
pub struct RequestMatchArgs {
    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Participant as <champion_id>:<user>, in seat order (repeatable)
    #[arg(long = "player", required = true)]
    pub players: Vec<String>,

    /// Extra referee/client flag as <label>=<value> (repeatable)
    #[arg(long = "option")]
    pub options: Vec<String>,

    /// Flag whose value is a file, as <label>=<path> (repeatable)
    #[arg(long = "file-option")]
    pub file_options: Vec<String>,
}

pub async fn execute_submit(args: SubmitChampionArgs) -> Result<()> {
    let config = load_config(args.config)?;
    let client = master_client(&config)?;

    let sources = std::fs::read(&args.sources)
        .with_context(|| format!("Failed to read {}", args.sources.display()))?;

    let response = client
        .submit_champion(&SubmitChampionRequest {
            user: args.user,
            name: args.name,
            sources_b64: general_purpose::STANDARD.encode(sources),
        })
        .await
        .context("Failed to submit the champion")?;

    println!("champion {} submitted", response.champion_id);
    Ok(())
}

pub async fn execute_match(args: RequestMatchArgs) -> Result<()> {
    let config = load_config(args.config)?;
    let client = master_client(&config)?;

    let mut players = Vec::new();
    for spec in &args.players {
        let Some((champion_id, user)) = spec.split_once(':') else {
            bail!("Invalid --player '{spec}', expected <champion_id>:<user>");
        };
        players.push(MatchPlayerSpec {
            champion_id: champion_id
                .parse()
                .with_context(|| format!("Invalid champion id in --player '{spec}'"))?,
            user: user.to_string(),
        });
    }

    let options = parse_pairs(&args.options, "--option")?;
    let mut file_options = BTreeMap::new();
    for (label, path) in parse_pairs(&args.file_options, "--file-option")? {
        let contents =
            std::fs::read(&path).with_context(|| format!("Failed to read {path}"))?;
        file_options.insert(label, general_purpose::STANDARD.encode(contents));
    }

    let response = client
        .request_match(&RequestMatchRequest {
            players,
            options,
            file_options,
        })
        .await
        .context("Failed to request the match")?;

    println!("match {} requested", response.match_id);
    Ok(())
}

fn parse_pairs(pairs: &[String], flag: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid {flag} '{pair}', expected <label>=<value>");
        };
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}
