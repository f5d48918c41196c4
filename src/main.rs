use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "quote-harvest",
    version,
    about = "Extract hotel quotations from Gmail threads into Google Sheets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List Gmail labels
    Labels,
    /// Tag messages that look like hotel quotations with a label
    Label(LabelArgs),
    /// Download labelled threads into thread documents
    Dump(DumpArgs),
    /// Print a thread document as the extractor sees it
    Show(ShowArgs),
    /// Run thread documents through the model into a JSONL file
    Extract(ExtractArgs),
    /// Append a JSONL file of records to the spreadsheet
    Push(PushArgs),
    /// Extract, then push what was extracted
    Run(ExtractArgs),
}

#[derive(Debug, Args)]
struct LabelArgs {
    /// Label to apply; created if missing
    #[arg(long, env = "QUOTES_LABEL_NAME", default_value = "QUOTES")]
    label: String,
    /// Gmail search query selecting the threads to scan
    #[arg(long, short = 'q', default_value = "newer_than:60d in:anywhere")]
    query: String,
    /// Maximum number of messages (not threads) to list
    #[arg(long)]
    max: Option<usize>,
    /// Score and report without changing the mailbox
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DumpArgs {
    /// Label name (or id) to read from
    #[arg(long, default_value = "COMPLETE_DATA")]
    label: String,
    /// Gmail search query, e.g. 'from:reservas@hotel.com'
    #[arg(long, short = 'q')]
    query: Option<String>,
    /// Only messages after this date (YYYY/MM/DD)
    #[arg(long)]
    after: Option<String>,
    /// Only messages before this date (YYYY/MM/DD)
    #[arg(long)]
    before: Option<String>,
    /// Maximum number of messages (not threads) to scan
    #[arg(long, default_value_t = 500)]
    max: usize,
    #[arg(long, default_value = "raw_messages")]
    out_dir: PathBuf,
}

#[derive(Debug, Args)]
struct ShowArgs {
    path: PathBuf,
    /// Print the exact prompt sent to the model
    #[arg(long, default_value_t = false)]
    prompt: bool,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    /// Thread document or directory of thread documents
    #[arg(default_value = "raw_messages")]
    input: PathBuf,
    #[arg(long, default_value = "outputs/quotes_extracted.jsonl")]
    output: PathBuf,
    #[arg(long, default_value = "outputs/review.jsonl")]
    review_log: PathBuf,
    /// Process at most this many thread documents
    #[arg(long)]
    limit: Option<usize>,
    /// Append to the output file instead of replacing it
    #[arg(long, default_value_t = false)]
    append: bool,
}

#[derive(Debug, Args)]
struct PushArgs {
    #[arg(default_value = "outputs/quotes_extracted.jsonl")]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            tracing::warn!("ignoring unreadable .env file: {error}");
        }
    }

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use anyhow::{Context, Result};

    use quote_harvest::config::Config;
    use quote_harvest::connectors::thread_archive::load_thread_file;
    use quote_harvest::connectors::{GeminiClient, GmailApiConnector, MailSource, SheetsStore};
    use quote_harvest::extract::{build_thread_prompt, QuoteRecord};
    use quote_harvest::output::{self, OutputFormat};
    use quote_harvest::pipeline::{self, DumpOptions, ExtractOptions, LabelOptions, RunSummary};
    use quote_harvest::sink::{read_jsonl, SinkWriter};

    use super::{Cli, Commands, DumpArgs, ExtractArgs, LabelArgs, PushArgs, ShowArgs};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let config = Config::from_env().context("load configuration from environment")?;
        let format = OutputFormat::from_json_flag(cli.json);

        match cli.command {
            Commands::Labels => handle_labels(&config, format).await,
            Commands::Label(args) => handle_label(&config, args, format).await,
            Commands::Dump(args) => handle_dump(&config, args, format).await,
            Commands::Show(args) => handle_show(&config, args, format),
            Commands::Extract(args) => {
                let summary = run_extract(&config, &args).await?;
                print_summary(format, "Extraction complete", &summary)
            }
            Commands::Push(args) => {
                let summary = run_push(&config, &args).await?;
                print_summary(format, "Push complete", &summary)
            }
            Commands::Run(args) => handle_run(&config, args, format).await,
        }
    }

    fn gmail(config: &Config) -> Result<GmailApiConnector> {
        let credentials = config.gmail().context("configure Gmail access")?;
        GmailApiConnector::new(credentials, config.retry.clone(), config.request_timeout)
            .context("build Gmail client")
    }

    async fn handle_labels(config: &Config, format: OutputFormat) -> Result<()> {
        let mut labels = gmail(config)?
            .list_labels()
            .await
            .context("list Gmail labels")?;
        labels.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        println!("{}", output::format_labels(format, &labels)?);
        Ok(())
    }

    async fn handle_label(config: &Config, args: LabelArgs, format: OutputFormat) -> Result<()> {
        let connector = gmail(config)?;
        let options = LabelOptions {
            label: args.label,
            query: Some(args.query),
            max: args.max,
            dry_run: args.dry_run,
        };

        let summary = pipeline::label(&connector, &options, config.timezone)
            .await
            .with_context(|| format!("label quotations with '{}'", options.label))?;
        let title = if options.dry_run {
            "Labelling dry run complete"
        } else {
            "Labelling complete"
        };
        print_summary(format, title, &summary)
    }

    async fn handle_dump(config: &Config, args: DumpArgs, format: OutputFormat) -> Result<()> {
        let connector = gmail(config)?;
        let options = DumpOptions {
            label: args.label,
            query: args.query,
            after: args.after,
            before: args.before,
            max: Some(args.max),
            out_dir: args.out_dir,
        };

        let summary = pipeline::dump(&connector, &options, config.timezone)
            .await
            .with_context(|| format!("dump label '{}'", options.label))?;
        print_summary(format, "Dump complete", &summary)
    }

    fn handle_show(config: &Config, args: ShowArgs, format: OutputFormat) -> Result<()> {
        let archived = load_thread_file(&args.path, config.timezone)
            .with_context(|| format!("read thread document {}", args.path.display()))?;

        let rendered = if args.prompt {
            output::format_prompt(format, &build_thread_prompt(&archived.thread))?
        } else {
            output::format_thread(format, &archived.thread)?
        };
        println!("{rendered}");
        Ok(())
    }

    async fn run_extract(config: &Config, args: &ExtractArgs) -> Result<RunSummary> {
        let gemini = config.gemini().context("configure Gemini access")?;
        let llm = GeminiClient::new(gemini, config.retry.clone(), config.request_timeout)
            .context("build Gemini client")?;
        tracing::info!(model = %llm.model(), "extracting with gemini");

        let options = ExtractOptions {
            output: args.output.clone(),
            review_log: args.review_log.clone(),
            limit: args.limit,
            append: args.append,
        };
        pipeline::extract(&llm, &args.input, &options, config.timezone)
            .await
            .with_context(|| format!("extract quotes from {}", args.input.display()))
    }

    fn sheets_sink(config: &Config) -> Result<SinkWriter<SheetsStore>> {
        let sheets = config.sheets().context("configure Google Sheets access")?;
        let store = SheetsStore::new(sheets, config.retry.clone(), config.request_timeout)
            .context("build Google Sheets client")?;
        Ok(SinkWriter::new(store, config.retry.clone()))
    }

    async fn run_push(config: &Config, args: &PushArgs) -> Result<RunSummary> {
        let sink = sheets_sink(config)?;
        pipeline::push(&sink, &args.input, &config.header)
            .await
            .with_context(|| format!("push records from {}", args.input.display()))
    }

    async fn handle_run(config: &Config, args: ExtractArgs, format: OutputFormat) -> Result<()> {
        // The sink is built first so missing Sheets credentials fail before any model call.
        let sink = sheets_sink(config)?;
        let mut summary = run_extract(config, &args).await?;

        // With --append the file also holds earlier runs; only this run's lines are pushed.
        let contents = read_jsonl::<QuoteRecord>(&args.output)
            .with_context(|| format!("read extracted records from {}", args.output.display()))?;
        let fresh = &contents.items[contents.items.len().saturating_sub(summary.written)..];

        let mut pushed = RunSummary::new(summary.run_id.clone());
        pipeline::push_records(&sink, fresh, &config.header, &mut pushed)
            .await
            .with_context(|| format!("push records from {}", args.output.display()))?;

        summary.failed += pushed.failed;
        summary.warnings.extend(pushed.warnings);
        if pushed.written != summary.written {
            summary.warnings.push(format!(
                "{} records extracted but {} rows pushed",
                summary.written, pushed.written
            ));
        }
        print_summary(format, "Run complete", &summary)
    }

    fn print_summary(format: OutputFormat, title: &str, summary: &RunSummary) -> Result<()> {
        println!("{}", output::format_summary(format, title, summary)?);
        Ok(())
    }
}
