use clap::Parser;
use log::{error, info};
use storyreel::RecorderConfig;

#[derive(Parser, Debug)]
#[command(name = "storyreel", version, about = "Record a narrated story page to video")]
struct Cli {
    /// Story file under `stories/` (a leading `@` is ignored)
    story: String,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let code = match run(&cli.story).await {
        Ok(report) => {
            info!("✨ Done: {}", report.output.display());
            if let Some(mp4) = &report.mp4 {
                info!("✨ MP4 export: {}", mp4.display());
            }
            0
        }
        Err(e) => {
            error!("❌ Error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(story: &str) -> storyreel::Result<storyreel::pipeline::RunReport> {
    let root = std::env::current_dir()
        .map_err(|e| storyreel::Error::Config(format!("cannot determine working directory: {}", e)))?;
    let config = RecorderConfig::load(root)?;
    storyreel::pipeline::run(&config, story).await
}
