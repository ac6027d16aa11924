#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::{Parser, Subcommand};
use hermes::{Hermes, config::find_config_file};
use hermes_common::{Attachment, compose::OutboundEmail, delivery::MessageStatus};

/// Transactional email transport engine
#[derive(Parser, Debug)]
#[command(name = "hermes")]
#[command(about = "Receive, sign and deliver email", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file; otherwise `HERMES_CONFIG`, ./hermes.config.ron
    /// or /etc/hermes/hermes.config.ron
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the listeners and the webhook service (default)
    Run,
    /// Validate the configuration, including the DKIM key, and exit
    CheckConfig,
    /// Compose one message and deliver it with the configured engine
    Send(SendArgs),
}

#[derive(clap::Args, Debug)]
struct SendArgs {
    /// `From` header, defaults to noreply@<domain>
    #[arg(long)]
    from: Option<String>,

    #[arg(long, required = true)]
    to: Vec<String>,

    #[arg(long)]
    cc: Vec<String>,

    #[arg(long)]
    bcc: Vec<String>,

    #[arg(long)]
    reply_to: Option<String>,

    #[arg(short, long, default_value = "")]
    subject: String,

    /// Plain text body
    #[arg(long)]
    text: Option<String>,

    /// HTML body
    #[arg(long)]
    html: Option<String>,

    /// Files to attach
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
}

impl SendArgs {
    fn into_email(self) -> anyhow::Result<OutboundEmail> {
        let attachments = self
            .attachments
            .iter()
            .map(|path| {
                let content = std::fs::read(path)
                    .with_context(|| format!("Unable to read attachment {}", path.display()))?;
                let filename = path
                    .file_name()
                    .map_or_else(|| String::from("attachment"), |name| {
                        name.to_string_lossy().into_owned()
                    });

                Ok(Attachment {
                    content_type: content_type(&filename).to_string(),
                    filename,
                    content,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(OutboundEmail {
            from: self.from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            reply_to: self.reply_to,
            subject: self.subject,
            text: self.text,
            html: self.html,
            attachments,
            headers: Vec::new(),
        })
    }
}

fn content_type(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config.as_deref())?;
    let hermes = Hermes::from_file(&config_path)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => hermes.run().await.map(|()| ExitCode::SUCCESS),
        Command::CheckConfig => {
            hermes.check()?;
            println!("{}: configuration OK", config_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Send(args) => {
            let email = args.into_email()?;
            let report = hermes.send(&email).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            Ok(match report.status {
                MessageStatus::Sent => ExitCode::SUCCESS,
                MessageStatus::Failed => ExitCode::FAILURE,
            })
        }
    }
}
