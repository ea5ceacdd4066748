use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dx_transfer::{
    ApiArgs, ApiConfig, DownloadOptions, DownloadStream, PlatformClient, UploadOptions,
    UploadPipeline,
    services::{ObjectBackend, UploadChunkPlanner},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::File,
    io::{self, AsyncWriteExt},
};
use tracing_subscriber::EnvFilter;

/// Upload and download platform file objects.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resilient file transfer client")]
struct Cli {
    #[command(flatten)]
    api: ApiArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file (or stdin with `-`) into a new object
    Upload {
        path: PathBuf,

        /// Destination project
        #[arg(long)]
        project: Option<String>,

        /// Object name; defaults to the file name
        #[arg(long)]
        name: Option<String>,

        /// Destination folder, created if missing
        #[arg(long)]
        folder: Option<String>,

        /// Part size in bytes
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Parts uploaded in parallel
        #[arg(long)]
        concurrency: Option<usize>,

        /// Refuse to create an empty object
        #[arg(long)]
        require_content: bool,

        /// Return once close is requested instead of waiting for `closed`
        #[arg(long)]
        no_wait: bool,
    },

    /// Download a closed object to a file (or stdout with `-`)
    Download {
        object_id: String,

        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// First byte to download
        #[arg(long)]
        start: Option<u64>,

        /// One past the last byte to download
        #[arg(long)]
        end: Option<u64>,
    },

    /// Print an object's description as JSON
    Describe { object_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config ---
    let cli = Cli::parse();
    let cfg = ApiConfig::from_env()?.merge_args(&cli.api)?;
    tracing::debug!("Using API server {}", cfg.api_server());

    let client = PlatformClient::from_config(&cfg)?;

    match cli.command {
        Command::Upload {
            path,
            project,
            name,
            folder,
            chunk_size,
            concurrency,
            require_content,
            no_wait,
        } => {
            let mut builder = UploadOptions::builder().require_content(require_content);
            if let Some(project) = project {
                builder = builder.project(project);
            }
            let name = name.or_else(|| {
                path.file_name()
                    .filter(|n| *n != "-")
                    .map(|n| n.to_string_lossy().into_owned())
            });
            if let Some(name) = name {
                builder = builder.name(name);
            }
            if let Some(folder) = folder {
                builder = builder.folder(folder);
            }
            if let Some(size) = chunk_size {
                builder = builder.chunk_size(size);
            }
            if let Some(n) = concurrency {
                builder = builder.concurrency(n);
            }
            let options = builder.build()?;

            upload(client, &path, options, no_wait).await?;
        }
        Command::Download {
            object_id,
            output,
            start,
            end,
        } => download(client, &object_id, &output, start, end).await?,
        Command::Describe { object_id } => {
            let description = client.describe_object(&object_id).await?;
            println!("{}", serde_json::to_string_pretty(&description)?);
        }
    }

    Ok(())
}

async fn upload(
    client: PlatformClient,
    path: &Path,
    options: UploadOptions,
    no_wait: bool,
) -> Result<()> {
    let mut pipeline = UploadPipeline::create(Arc::new(client), options.clone()).await?;
    tracing::info!("Uploading {} into {}", path.display(), pipeline.object().id);

    if path.as_os_str() == "-" {
        pipeline.upload_reader(io::stdin()).await?;
    } else {
        let file = File::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let len = file.metadata().await?.len();
        UploadChunkPlanner::new(options.chunk_size, options.part_limits)?
            .check_total(len)?;
        pipeline.upload_reader(file).await?;
    }

    let object = if no_wait {
        pipeline.finish().await?;
        pipeline.close().await?;
        pipeline.object().clone()
    } else {
        pipeline.close_and_wait().await?
    };
    println!("{}", object.id);
    Ok(())
}

async fn download(
    client: PlatformClient,
    object_id: &str,
    output: &Path,
    start: Option<u64>,
    end: Option<u64>,
) -> Result<()> {
    let description = client.describe_object(object_id).await?;
    let fetcher = client.range_fetcher(&description).await?;
    let mut stream =
        DownloadStream::from_description(&description, fetcher, DownloadOptions::default())?;

    let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin> = if output.as_os_str() == "-" {
        Box::new(io::stdout())
    } else {
        Box::new(
            File::create(output)
                .await
                .with_context(|| format!("creating {}", output.display()))?,
        )
    };

    if start.is_some() || end.is_some() {
        let bytes = stream.download_range(start.unwrap_or(0), end).await?;
        sink.write_all(&bytes).await?;
    } else {
        let mut buf = vec![0u8; 1024 * 1024];
        while let Some(n) = stream.read(&mut buf).await? {
            sink.write_all(&buf[..n]).await?;
        }
    }
    sink.flush().await?;
    tracing::info!("Downloaded {} ({} bytes)", object_id, stream.len());
    Ok(())
}
