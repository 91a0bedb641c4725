use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leaflet_engine::{default_engine, DocumentRasterSource, LopdfEngine, OpenSource, PageRasterSource};
use leaflet_viewer::{fetch, is_remote, PageSlot, RenderedBitmap, ViewerConfig, ViewerController};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Upper bound on waiting for the pages of one `render` call.
const RENDER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Parser)]
#[command(name = "leaflet")]
#[command(about = "Paged PDF rasterizer")]
pub struct Cli {
    /// Log debug output to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable page geometry.
    Info {
        /// PDF file path or http(s) URL.
        #[arg(value_name = "SOURCE")]
        source: String,
    },
    /// Rasterize a range of pages to PNG files.
    Render {
        /// PDF file path or http(s) URL.
        #[arg(value_name = "SOURCE")]
        source: String,
        /// First page, 1-based.
        #[arg(long, default_value_t = 1)]
        first: u32,
        /// Last page, 1-based. Defaults to --first.
        #[arg(long)]
        last: Option<u32>,
        /// Render in inverted colours.
        #[arg(long)]
        dark: bool,
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Download a document.
    Fetch {
        #[arg(value_name = "URL")]
        url: String,
        #[arg(long)]
        output: PathBuf,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct InfoOutput {
    source: String,
    page_count: u32,
    pages: Vec<PageOutput>,
}

#[derive(Debug, Serialize)]
struct PageOutput {
    index: u32,
    width: u32,
    height: u32,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Info { source } => run_info(&source),
        Commands::Render { source, first, last, dark, output_dir } => {
            run_render(&source, first, last, dark, &output_dir)
        }
        Commands::Fetch { url, output } => run_fetch(&url, &output),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // Already installed when `run` is called more than once in a process.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn run_info(source: &str) -> Result<()> {
    let document = open_document(source)?;

    let page_count = document.page_count();
    let pages = (0..page_count)
        .map(|index| {
            let page = document.dimensions(index)?;
            Ok(PageOutput { index, width: page.width, height: page.height })
        })
        .collect::<Result<Vec<_>>>()?;

    let payload = InfoOutput { source: source.to_owned(), page_count, pages };
    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    document.close();
    Ok(())
}

fn run_render(
    source: &str,
    first: u32,
    last: Option<u32>,
    dark: bool,
    output_dir: &Path,
) -> Result<()> {
    if first == 0 {
        anyhow::bail!("--first is 1-based and must be >= 1");
    }
    let last = last.unwrap_or(first);
    if last < first {
        anyhow::bail!("--last must not be before --first");
    }

    let config = ViewerConfig::load().context("failed to load viewer configuration")?;
    // Keep the whole window resident so no page is evicted before it is written.
    let window = (last - first + 1) as usize + 2 * config.lookahead_margin as usize;
    let capacity = config.cache_capacity.max(window);
    let mut viewer = ViewerController::new(config.with_cache_capacity(capacity))?;
    tracing::debug!(source, first, last, dark, capacity, "rendering pages");

    viewer.open(Arc::new(open_document(source)?))?;
    viewer.set_visible_range(first - 1, last - 1)?;
    if dark {
        viewer.toggle_mode()?;
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let deadline = Instant::now() + RENDER_TIMEOUT;
    for page in first..=last {
        let bitmap = wait_for_page(&viewer, page - 1, deadline)?;
        let output = output_dir.join(format!("page-{page}.png"));
        bitmap
            .image
            .save(&output)
            .with_context(|| format!("failed to write image to {}", output.display()))?;
        println!("{}", output.display());
    }

    viewer.close();
    Ok(())
}

fn wait_for_page(
    viewer: &ViewerController,
    index: u32,
    deadline: Instant,
) -> Result<Arc<RenderedBitmap>> {
    loop {
        match viewer.item_at(index)? {
            PageSlot::Ready(bitmap) => return Ok(bitmap),
            PageSlot::Failed(failure) => {
                anyhow::bail!("page {} failed to render: {}", index + 1, failure.reason)
            }
            PageSlot::Pending => {
                let now = Instant::now();
                if now >= deadline {
                    anyhow::bail!("timed out waiting for page {}", index + 1);
                }
                viewer.wait_event(deadline - now)?;
            }
        }
    }
}

fn run_fetch(url: &str, output: &Path) -> Result<()> {
    let bytes = fetch(url)?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, &bytes)
        .with_context(|| format!("failed to write document to {}", output.display()))?;

    println!("{}", output.display());
    Ok(())
}

/// Open a local path or download a URL.
fn open_document(source: &str) -> Result<DocumentRasterSource<LopdfEngine>> {
    let open_source = if is_remote(source) {
        OpenSource::Bytes(fetch(source)?)
    } else {
        let path = Path::new(source);
        ensure_pdf_exists(path)?;
        OpenSource::from(path)
    };

    DocumentRasterSource::open(default_engine(), open_source).context("failed to open PDF")
}

fn ensure_pdf_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}
