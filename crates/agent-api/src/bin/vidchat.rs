//! Terminal front-end: upload a video, follow its processing, then chat.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use vidchat_agent_api::client::{ApiClient, PollOptions};
use vidchat_agent_api::schema::TaskStatusResponse;
use vidchat_agent_api::task::TaskStatus;

#[derive(Parser)]
#[command(name = "vidchat", version, about = "Chat with an agent about your videos")]
struct Cli {
    /// Base URL of the agent API.
    #[arg(long, env = "VIDCHAT_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a video and wait until processing finishes.
    Process {
        file: PathBuf,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Print the current status of a task.
    Status { task_id: String },
    /// Start an interactive chat, optionally about a processed video.
    Chat {
        #[arg(long)]
        video: Option<String>,
    },
    /// Upload, wait for processing, then chat about the result.
    Run {
        file: PathBuf,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Clear the agent's conversation memory.
    ResetMemory,
}

#[derive(clap::Args)]
struct PollArgs {
    /// Seconds between status checks.
    #[arg(long, default_value_t = 2)]
    interval: u64,
    /// Give up after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

impl PollArgs {
    fn options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_secs(self.interval.max(1)),
            timeout: self.timeout.map(Duration::from_secs),
            ..PollOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(cli.api_url);

    match cli.command {
        Command::Process { file, poll } => {
            process(&client, &file, &poll.options()).await?;
        }
        Command::Status { task_id } => {
            let status = client.task_status(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Chat { video } => chat_loop(&client, video.as_deref()).await?,
        Command::Run { file, poll } => {
            let done = process(&client, &file, &poll.options()).await?;
            chat_loop(&client, done.video_url.as_deref()).await?;
        }
        Command::ResetMemory => println!("{}", client.reset_memory().await?),
    }
    Ok(())
}

async fn process(
    client: &ApiClient,
    file: &std::path::Path,
    options: &PollOptions,
) -> anyhow::Result<TaskStatusResponse> {
    let task_id = client
        .upload(file)
        .await
        .with_context(|| format!("failed to upload {}", file.display()))?;
    println!("uploaded {} as task {task_id}", file.display());

    let mut last = None;
    let done = client
        .wait_for_completion(&task_id, options, |update| {
            if last != Some(update.status) {
                println!("status: {}", update.status);
                last = Some(update.status);
            }
        })
        .await?;

    if done.status == TaskStatus::Failed {
        bail!(
            "processing failed: {}",
            done.error.as_deref().unwrap_or("no details")
        );
    }
    println!(
        "processed {}: {}",
        done.title.as_deref().unwrap_or_default(),
        done.video_url.as_deref().unwrap_or_default()
    );
    Ok(done)
}

async fn chat_loop(client: &ApiClient, video: Option<&str>) -> anyhow::Result<()> {
    println!("chat mode; type /reset to clear memory, /quit to leave");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        match message {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => println!("{}", client.reset_memory().await?),
            _ => match client.chat(message, video).await {
                Ok(reply) => println!("{reply}"),
                Err(e) => eprintln!("error: {e}"),
            },
        }
    }
    Ok(())
}
