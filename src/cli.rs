use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Debugging front end for the source pipeline
#[derive(Parser)]
#[command(name = "vodsource")]
#[command(about = "Identify video-source configs and fetch their content", long_about = None)]
pub struct Cli {
    /// TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Site selection shared by commands that talk to one site.
#[derive(clap::Args)]
pub struct SiteArgs {
    /// Config URL, local path (file://) or pasted config text
    pub input: String,
    /// Pick the site with this key instead of the default one
    #[arg(long)]
    pub site: Option<String>,
    /// Spider class (e.g. csp_Bili) to select from the manifest
    #[arg(long)]
    pub class: Option<String>,
    /// Spider artifact URL used when the manifest names none
    #[arg(long)]
    pub spider: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show what a config input is
    Identify {
        input: String,
        #[arg(short, long, default_value = "")]
        name: String,
    },
    /// List every site of a manifest
    Sites {
        input: String,
    },
    /// Fetch home content for a site
    Home {
        #[command(flatten)]
        target: SiteArgs,
    },
    /// Search a site
    Search {
        #[command(flatten)]
        target: SiteArgs,
        #[arg(short, long)]
        keyword: String,
    },
    /// Resolve a playable URL for one episode
    Play {
        #[command(flatten)]
        target: SiteArgs,
        #[arg(long)]
        flag: String,
        #[arg(long)]
        id: String,
    },
}
