use clap::{ArgAction, Parser};

use crate::xml::{ParserOptions, TagCase};
use crate::zip::EntryFilter;

#[derive(Parser, Debug)]
#[command(name = "xmlzip")]
#[command(version)]
#[command(about = "Extract XML documents and rows from ZIP archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  xmlzip data.zip                       print every XML entry as a JSON tree\n  \
  xmlzip -t item data.zip               stream <item> rows as JSON lines\n  \
  cat data.zip | xmlzip -t item -       read the archive from stdin\n  \
  xmlzip -l https://example.com/a.zip   list XML entries of a remote archive")]
pub struct Cli {
    /// ZIP file path, `-` for stdin, or HTTP URL
    #[arg(value_name = "FILE")]
    pub file: String,

    /// List matching entries
    #[arg(short = 'l')]
    pub list: bool,

    /// Stream rows of elements named TAG instead of whole documents
    #[arg(short = 't', long = "tag", value_name = "TAG")]
    pub tag: Option<String>,

    /// Represent every child element as an array
    #[arg(short = 'a', long = "always-array")]
    pub always_array: bool,

    /// Entry extensions to accept (default: xml)
    #[arg(short = 'e', long = "ext", value_name = "EXT", num_args = 1..)]
    pub extensions: Vec<String>,

    /// Keep element names as written instead of upper-casing them
    #[arg(long = "preserve-case")]
    pub preserve_case: bool,

    /// Maximum rows per batch when streaming
    #[arg(short = 'b', long = "batch-size", value_name = "N", default_value_t = 1000)]
    pub batch_size: usize,

    /// More log output (-vv for trace)
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Only print results, no warnings
    #[arg(short = 'q')]
    pub quiet: bool,
}

impl Cli {
    pub fn is_http_url(&self) -> bool {
        self.file.starts_with("http://") || self.file.starts_with("https://")
    }

    pub fn is_stdin(&self) -> bool {
        self.file == "-"
    }

    /// Default log filter for the chosen verbosity
    pub fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "off",
            (false, 0) => "warn",
            (false, 1) => "debug",
            (false, _) => "trace",
        }
    }

    pub fn parser_options(&self) -> ParserOptions {
        let tag_case = if self.preserve_case {
            TagCase::Preserve
        } else {
            TagCase::Upper
        };
        ParserOptions::default()
            .with_always_array(self.always_array)
            .with_tag_case(tag_case)
            .with_batch_size(self.batch_size)
    }

    pub fn entry_filter(&self) -> EntryFilter {
        if self.extensions.is_empty() {
            EntryFilter::default()
        } else if self.extensions.iter().any(|e| e == "*") {
            EntryFilter::any()
        } else {
            EntryFilter::with_extensions(&self.extensions)
        }
    }
}
