//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chunkferry_client::{
    ChunkTransport, UploadEvent, UploadOutcome, Uploader, UploaderConfig, WsTransport,
};
use chunkferry_protocol::VerifyRequest;
use chunkferry_transfer::{ChunkSource, FileSource, Fingerprinter, split_into_chunks};

/// Uploads `file`; Ctrl-C pauses and a later run resumes.
pub async fn upload(
    server: &str,
    file: &Path,
    name: Option<String>,
    config: UploaderConfig,
) -> Result<()> {
    let filename = match name {
        Some(name) => name,
        None => file_name(file)?,
    };
    let source = Arc::new(
        FileSource::open(file)
            .await
            .with_context(|| format!("failed to open {}", file.display()))?,
    );

    let transport = WsTransport::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    let mut uploader = Uploader::new(Arc::new(transport), config);
    let mut events = uploader
        .take_events()
        .context("upload events already taken")?;
    let printer = tokio::spawn(async move {
        let mut last = -1i64;
        while let Some(event) = events.recv().await {
            match event {
                UploadEvent::HashProgress { percent } => {
                    report(&mut last, "hashing", percent);
                }
                UploadEvent::TotalProgress { percent } => {
                    report(&mut last, "uploading", percent);
                }
                UploadEvent::Failed { reason } => eprintln!("upload failed: {reason}"),
                _ => {}
            }
        }
    });

    let pause = uploader.pause_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("pausing...");
            pause.pause();
        }
    });

    let mut session = uploader.open(source, filename)?;
    let outcome = uploader.run(&mut session).await;
    interrupt.abort();
    drop(uploader);
    let _ = printer.await;

    match outcome? {
        UploadOutcome::Instant { message } => {
            println!(
                "already on server: {}",
                message.unwrap_or_else(|| "nothing to send".into())
            );
        }
        UploadOutcome::Merged { url, .. } => println!("uploaded: {url}"),
        UploadOutcome::Paused { remaining } => {
            println!("paused with {remaining} chunk(s) left; run the same command to resume");
        }
    }
    Ok(())
}

/// Fingerprints `file` and reports what the server holds for it.
pub async fn status(server: &str, file: &Path, chunk_size: u64) -> Result<()> {
    let source = Arc::new(
        FileSource::open(file)
            .await
            .with_context(|| format!("failed to open {}", file.display()))?,
    );
    let chunks = split_into_chunks(source.byte_len(), chunk_size)?;
    let total = chunks.len();
    let hash = Fingerprinter::spawn(source, chunks).finish(|_| {}).await?;

    let transport = WsTransport::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    let resp = transport
        .verify(VerifyRequest {
            filename: file_name(file)?,
            file_hash: hash.clone(),
        })
        .await?;
    transport.close().await;

    println!("file hash: {hash}");
    if resp.should_upload {
        println!("chunks on server: {}/{total}", resp.uploaded_list.len());
    } else {
        println!("complete on server");
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

fn report(last: &mut i64, stage: &str, percent: f64) {
    let whole = percent.floor() as i64;
    if whole != *last {
        *last = whole;
        eprintln!("{stage}: {whole}%");
    }
}
