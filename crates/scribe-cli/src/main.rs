mod render;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use scribe_client::{ChannelManager, ClientConfig, Payload, UploadController};
use tracing::info;

/// Upload a video to the transcription service and print the transcript as it arrives.
#[derive(Parser, Debug)]
#[command(name = "scribe", version, about)]
struct Cli {
    /// File to transcribe
    file: PathBuf,

    /// Service WebSocket URL [env: SCRIBE_ENDPOINT]
    #[arg(long)]
    endpoint: Option<String>,

    /// Frame size in bytes [env: SCRIBE_CHUNK_SIZE]
    #[arg(long)]
    chunk_size: Option<usize>,

    /// MIME type to declare instead of guessing from the file name
    #[arg(long)]
    mime: Option<String>,

    /// Print each view update as a JSON line instead of text
    #[arg(long)]
    json: bool,

    /// Give up waiting for the transcript after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(endpoint) = &self.endpoint {
            config.channel.endpoint = endpoint.clone();
        }
        if let Some(size) = self.chunk_size.filter(|&n| n > 0) {
            config.upload.chunk_size = size;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scribe=info,scribe_client=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    cli.apply(&mut config);
    info!(endpoint = %config.channel.endpoint, chunk_size = config.upload.chunk_size, "starting");

    let mut payload = Payload::open(&cli.file)
        .await
        .with_context(|| format!("cannot open {}", cli.file.display()))?;
    if let Some(mime) = &cli.mime {
        payload = payload.with_mime(mime.clone());
    }

    let channel = ChannelManager::new(config.channel.clone());
    let controller = UploadController::new(channel.clone(), config.upload.clone());
    let renderer = tokio::spawn(render::run(controller.view(), controller.progress(), cli.json));

    let outcome = async {
        let report = controller.upload(payload).await?;
        info!(frames = report.frames, bytes = report.bytes, sha256 = %report.sha256, "upload sent");

        let result = match cli.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), controller.wait_result())
                .await
                .context("timed out waiting for the transcript")?,
            None => controller.wait_result().await,
        };
        anyhow::Ok(result)
    };

    let result = tokio::select! {
        result = outcome => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };

    channel.shutdown();
    // Let the renderer print the last state before exiting.
    let _ = tokio::time::timeout(Duration::from_millis(200), renderer).await;

    let result = result?;
    if let Some(error) = &result.error {
        anyhow::bail!("transcription failed: {}", error);
    }
    if !result.is_terminal() {
        anyhow::bail!("connection closed before the transcript was complete");
    }

    if !cli.json {
        println!("{}", result.display_text());
    }
    Ok(())
}
