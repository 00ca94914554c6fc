mod cli;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, SiteArgs};
use vodsource::config::ResolverConfig;
use vodsource::result;
use vodsource::types::Site;
use vodsource::VodSource;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vodsource=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ResolverConfig::load(path)?,
        None => ResolverConfig::from_env(),
    };
    let source = VodSource::new(config)?;

    match cli.command {
        Commands::Identify { input, name } => match source.identify(&input, &name).await {
            Some(cfg) => println!("{}", serde_json::to_string_pretty(&cfg)?),
            None => return Err(anyhow!("unrecognised input: {}", input)),
        },
        Commands::Sites { input } => {
            let cfg = source.identify(&input, "").await.ok_or_else(|| anyhow!("unrecognised input: {}", input))?;
            for site in source.list_sites(&cfg) {
                println!("{}\t{}\ttype={}\t{:?}\t{}", site.key, site.name, site.kind, site.strategy(), site.api);
            }
        }
        Commands::Home { target } => {
            let site = pick_site(&source, &target).await?;
            let items = source.try_home_videos(&site).await?;
            println!("{}", result::to_json(&items));
        }
        Commands::Search { target, keyword } => {
            let site = pick_site(&source, &target).await?;
            let items = source.search(&site, &keyword).await?;
            println!("{}", result::to_json(&items));
        }
        Commands::Play { target, flag, id } => {
            let site = pick_site(&source, &target).await?;
            match source.play_url(&site, &flag, &id).await {
                Some(target) => {
                    println!("{}", target.url);
                    for (k, v) in &target.headers {
                        println!("{}: {}", k, v);
                    }
                }
                None => return Err(anyhow!("no playable url for {} on {}", id, flag)),
            }
        }
    }
    Ok(())
}

async fn pick_site(source: &VodSource, target: &SiteArgs) -> Result<Site> {
    let cfg = source
        .identify(&target.input, "")
        .await
        .ok_or_else(|| anyhow!("unrecognised input: {}", target.input))?;
    if let Some(key) = &target.site {
        return source
            .list_sites(&cfg)
            .into_iter()
            .find(|s| &s.key == key)
            .ok_or_else(|| anyhow!("no site with key {}", key));
    }
    source
        .resolve_site(&cfg, target.spider.as_deref(), target.class.as_deref())
        .ok_or_else(|| anyhow!("no usable site in {}", target.input))
}
