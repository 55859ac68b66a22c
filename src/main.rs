//! Command-line front end for xmlzip.
//!
//! HTTP URLs and local files are read through the central directory, remote
//! ones with Range requests. Stdin, and local files when streaming rows, are
//! read front to back so memory stays bounded by the open element path.

use anyhow::{Result, bail};
use clap::Parser;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter, Stdout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xmlzip::xml::{extract_rows, parse_document};
use xmlzip::{Cli, HttpRangeReader, LocalFileReader, ReadAt, XmlZipParser, ZipExtractor};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    let parser = XmlZipParser::new()
        .with_options(cli.parser_options())
        .with_filter(cli.entry_filter());
    let mut out = BufWriter::new(tokio::io::stdout());

    let failures = if cli.is_http_url() {
        let reader = HttpRangeReader::new(cli.file.clone()).await?;
        let transferred_before = reader.transferred_bytes();
        let reader = Arc::new(reader);

        let failures = process_random_access(reader.clone(), &parser, &cli, &mut out).await?;
        info!(
            bytes = reader.transferred_bytes() - transferred_before,
            "total bytes transferred"
        );
        failures
    } else if cli.is_stdin() {
        process_stream(tokio::io::stdin(), &parser, &cli, &mut out).await?
    } else if cli.tag.is_some() {
        let file = tokio::fs::File::open(&cli.file).await?;
        process_stream(file, &parser, &cli, &mut out).await?
    } else {
        let reader = Arc::new(LocalFileReader::new(Path::new(&cli.file))?);
        process_random_access(reader, &parser, &cli, &mut out).await?
    };

    out.flush().await?;
    if failures > 0 {
        bail!("{failures} entries could not be read");
    }
    Ok(())
}

/// Read a streamed archive. Returns the number of entries that failed.
async fn process_stream<R>(
    stream: R,
    parser: &XmlZipParser,
    cli: &Cli,
    out: &mut BufWriter<Stdout>,
) -> Result<usize>
where
    R: AsyncRead + Unpin + Send,
{
    let mut failures = 0;

    if cli.list {
        let mut entries = parser.read_streams_from_zip(stream);
        while let Some(entry) = entries.next_entry().await? {
            println_entry(out, &entry.name).await?;
        }
        return Ok(0);
    }

    if let Some(tag) = &cli.tag {
        let mut entries = parser.row_streams_from_zip(stream, tag.as_str());
        while let Some(mut entry) = entries.next_entry().await? {
            loop {
                match entry.rows.next_batch().await {
                    Ok(Some(batch)) => {
                        for row in &batch {
                            write_line(out, &json!({"file": entry.name, "row": row})).await?;
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.is_entry_scoped() => {
                        warn!(name = %entry.name, error = %e, "entry failed");
                        failures += 1;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        return Ok(failures);
    }

    let mut entries = parser.read_streams_from_zip(stream);
    while let Some(mut entry) = entries.next_entry().await? {
        let parsed = match entry.reader.read_to_end().await {
            Ok(data) => parse_document(&data, parser.options()),
            Err(e) => Err(e),
        };
        match parsed {
            Ok(node) => write_line(out, &json!({"file": entry.name, "data": node})).await?,
            Err(e) if e.is_entry_scoped() => {
                warn!(name = %entry.name, error = %e, "entry failed");
                failures += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(failures)
}

/// Read an archive through its central directory. Returns the number of
/// entries that failed.
async fn process_random_access<R: ReadAt + 'static>(
    reader: Arc<R>,
    parser: &XmlZipParser,
    cli: &Cli,
    out: &mut BufWriter<Stdout>,
) -> Result<usize> {
    if cli.list {
        let extractor = ZipExtractor::new(reader);
        for file in extractor.list_files().await? {
            if let Some(name) = parser.filter().accept(&file.file_name, file.is_directory) {
                println_entry(out, name).await?;
            }
        }
        return Ok(0);
    }

    let Some(tag) = &cli.tag else {
        let mut failures = 0;
        for file in parser.parse_from_reader(reader).await? {
            match file.parsed_data {
                Ok(node) => write_line(out, &json!({"file": file.name, "data": node})).await?,
                Err(e) => {
                    warn!(name = %file.name, error = %e, "entry failed");
                    failures += 1;
                }
            }
        }
        return Ok(failures);
    };

    let extractor = ZipExtractor::new(reader);
    let entries = extractor.entries_matching(parser.filter()).await?;
    let mut failures = 0;
    for entry in entries {
        let rows = entry
            .bytes()
            .and_then(|data| extract_rows(data, tag, parser.options()));
        match rows {
            Ok(rows) => {
                for row in &rows {
                    write_line(out, &json!({"file": entry.name, "row": row})).await?;
                }
            }
            Err(e) => {
                warn!(name = %entry.name, error = %e, "entry failed");
                failures += 1;
            }
        }
    }
    Ok(failures)
}

async fn write_line(out: &mut BufWriter<Stdout>, value: &serde_json::Value) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    Ok(())
}

async fn println_entry(out: &mut BufWriter<Stdout>, name: &str) -> Result<()> {
    out.write_all(name.as_bytes()).await?;
    out.write_all(b"\n").await?;
    Ok(())
}
