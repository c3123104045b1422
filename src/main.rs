use anyhow::{Context, Result};
use babel_fish::{
    batch::BatchTranslator,
    configs::AppConfig,
    languages::{is_supported, language_name},
    sessions::{Sender, SessionError, SessionTranslator, Transcript},
    tones::{Tone, validate_tone},
    translators::{DryRunTranslator, LlmTranslator, Translator, translate_with_retry},
    transport::OpenAiTransport,
};
use clap::{Parser, Subcommand, ValueEnum};
use futures::stream::{self, StreamExt};
use glob::glob;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "babel-fish")]
#[command(about = "Translate agent/customer chats using LLM", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate every untranslated message in chat transcripts
    Batch {
        #[arg(value_parser = check_file_exists, help = "Path to TOML configuration file")]
        config_path: PathBuf,

        #[arg(required = true, help = "Transcript files or glob patterns")]
        transcripts: Vec<String>,

        #[arg(short, long, help = "Dry run mode (transcripts are not written back)")]
        dry_run: bool,

        #[arg(
            long,
            default_value_t = 4,
            help = "Number of transcripts to process concurrently"
        )]
        session_concurrent: usize,

        #[arg(
            long,
            default_value_t = 1,
            help = "Manual retries for messages left untranslated"
        )]
        manual_retries: usize,
    },

    /// Translate a single message, optionally rewriting it in a tone
    Translate {
        #[arg(value_parser = check_file_exists, help = "Path to TOML configuration file")]
        config_path: PathBuf,

        #[arg(short, long, help = "Target language code")]
        to: String,

        #[arg(short, long, help = "Preset (happy, formal, casual, angry, playful, sad) or custom tone")]
        tone: Option<String>,

        #[arg(short, long, help = "Dry run mode (no actual translation)")]
        dry_run: bool,

        text: String,
    },

    /// Add a message to a transcript, translating it on the way in
    Say {
        #[arg(value_parser = check_file_exists, help = "Path to TOML configuration file")]
        config_path: PathBuf,

        #[arg(help = "Transcript file (created if missing)")]
        transcript: PathBuf,

        #[arg(short, long, value_enum, help = "Who sent the message")]
        from: Role,

        #[arg(short, long, help = "Tone for an agent reply (preset or custom)")]
        tone: Option<String>,

        #[arg(long, help = "Translation to store instead of asking the model")]
        translated: Option<String>,

        #[arg(long, help = "Store the message without translating it")]
        no_translate: bool,

        #[arg(short, long, help = "Dry run mode (no actual translation)")]
        dry_run: bool,

        text: String,
    },

    /// Remove every message from a transcript
    Clear {
        #[arg(value_parser = check_file_exists, help = "Transcript file")]
        transcript: PathBuf,
    },

    /// Check whether a custom tone would be accepted
    Tone { text: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Agent,
    Customer,
}

impl From<Role> for Sender {
    fn from(role: Role) -> Self {
        match role {
            Role::Agent => Sender::Agent,
            Role::Customer => Sender::Customer,
        }
    }
}

fn check_file_exists(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if path.exists() {
        Ok(path)
    } else {
        Err(format!("File '{}' not found", s))
    }
}

const DEFAULT_LOG_FILTER: &str = "babel_fish=info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    match args.command {
        Command::Batch {
            config_path,
            transcripts,
            dry_run,
            session_concurrent,
            manual_retries,
        } => {
            run_batch(
                &config_path,
                &transcripts,
                dry_run,
                session_concurrent,
                manual_retries,
            )
            .await
        }
        Command::Translate {
            config_path,
            to,
            tone,
            dry_run,
            text,
        } => run_translate(&config_path, &to, tone.as_deref(), dry_run, &text).await,
        Command::Say {
            config_path,
            transcript,
            from,
            tone,
            translated,
            no_translate,
            dry_run,
            text,
        } => {
            run_say(
                &config_path,
                &transcript,
                from.into(),
                tone.as_deref(),
                translated,
                !no_translate,
                dry_run,
                &text,
            )
            .await
        }
        Command::Clear { transcript } => run_clear(&transcript),
        Command::Tone { text } => run_tone(&text),
    }
}

fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        for path in glob(pattern)
            .with_context(|| format!("Invalid pattern '{}'", pattern))?
            .filter_map(Result::ok)
        {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    Ok(paths)
}

async fn run_batch(
    config_path: &Path,
    patterns: &[String],
    dry_run: bool,
    session_concurrent: usize,
    manual_retries: usize,
) -> Result<()> {
    let start_time = Instant::now();
    let config = AppConfig::load(config_path)?;

    println!("🐟 Babel Fish Translator");
    println!("📋 Config: {}", config_path.display());
    println!(
        "🎯 Languages: customer {} / agent {}",
        language_name(&config.session.customer_language),
        language_name(&config.session.agent_language)
    );
    println!(
        "🔁 Rounds per batch: {}",
        config.translation.max_batch_rounds
    );

    if dry_run {
        println!("🔍 Mode: DRY RUN");
    }

    let paths = expand_patterns(patterns)?;
    if paths.is_empty() {
        println!("⚠️  No transcripts found matching pattern");
        return Ok(());
    }

    println!("📁 Found {} transcript(s)\n", paths.len());

    let transport = OpenAiTransport::new(&config.llm)?;

    let multi_progress = Arc::new(MultiProgress::new());
    let main_pb = multi_progress.add(ProgressBar::new(paths.len() as u64));
    main_pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} chats ({msg})")?
            .progress_chars("█▓▒░"),
    );
    main_pb.set_message("processing...");

    let results: Vec<_> = stream::iter(paths)
        .map(|path| {
            let config = &config;
            let transport = transport.clone();
            let multi_progress = Arc::clone(&multi_progress);
            let main_pb = main_pb.clone();

            async move {
                let filename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string());

                let chat_pb = multi_progress.add(ProgressBar::new(0));
                if let Ok(style) = ProgressStyle::default_bar().template(&format!(
                    "💬 {} {{spinner:.green}} [{{bar:30.cyan/blue}}] {{pos}}/{{len}} msgs ({{msg}})",
                    filename
                )) {
                    chat_pb.set_style(style.progress_chars("█▓▒░"));
                }

                let res = translate_transcript(
                    config,
                    transport,
                    &path,
                    &filename,
                    chat_pb.clone(),
                    dry_run,
                    manual_retries,
                )
                .await;

                match &res {
                    Ok(stats) if stats.failed == 0 => {
                        chat_pb.finish_with_message(format!("✅ {} messages", stats.translated));
                    }
                    Ok(stats) => {
                        chat_pb.finish_with_message(format!(
                            "⚠️  {} translated, {} failed",
                            stats.translated, stats.failed
                        ));
                    }
                    Err(e) => {
                        chat_pb.finish_with_message(format!("❌ {}", e));
                    }
                }

                main_pb.inc(1);
                res
            }
        })
        .buffer_unordered(session_concurrent.max(1))
        .collect()
        .await;

    main_pb.finish_with_message("done");

    let total_ok = results.iter().filter(|r| r.is_ok()).count();
    let total_err = results.len() - total_ok;
    let (total_translated, total_failed) = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .fold((0, 0), |(translated, failed), s| {
            (translated + s.translated, failed + s.failed)
        });

    let duration = start_time.elapsed();

    println!("📊 Summary");
    println!("✅ Succeeded: {} chats", total_ok);
    println!("❌ Failed: {} chats", total_err);
    println!("📝 Translated: {} messages", total_translated);
    println!("⚠️  Untranslated: {} messages", total_failed);
    println!("⏱️ Duration: {:.2}s\n", duration.as_secs_f64());

    if total_err > 0 {
        std::process::exit(1);
    }

    Ok(())
}

struct TranscriptStats {
    translated: usize,
    failed: usize,
}

async fn translate_transcript(
    config: &AppConfig,
    transport: OpenAiTransport,
    path: &Path,
    filename: &str,
    pb: ProgressBar,
    dry_run: bool,
    manual_retries: usize,
) -> Result<TranscriptStats> {
    let mut transcript = Transcript::load(path)?;

    let pending = transcript.pending().count();
    pb.set_length(pending as u64);
    if pending == 0 {
        return Ok(TranscriptStats {
            translated: 0,
            failed: 0,
        });
    }

    let batch = BatchTranslator::new(transport, config.translation.batch_policy())
        .with_structured_output(config.translation.structured_output);
    let mut session = SessionTranslator::new(batch, &config.session);

    let mut translated = 0;
    let mut retries = 0;
    let report = loop {
        pb.set_message("translating");
        let progress = pb.clone();

        match session
            .translate_missing(&mut transcript, move |_, _| progress.inc(1))
            .await
        {
            Ok(report) => {
                translated += report.translated;
                if report.failed() == 0 || retries >= manual_retries {
                    break report;
                }
                retries += 1;
                pb.println(format!(
                    "    ⚠️  {} - {} message(s) could not be translated, retry {}/{}",
                    filename,
                    report.failed(),
                    retries,
                    manual_retries
                ));
            }
            Err(SessionError::CoolingDown { remaining }) => {
                pb.set_message(format!("rate limited, waiting {}s", remaining.as_secs()));
                tokio::time::sleep(remaining).await;
            }
        }
    };

    if dry_run {
        pb.println(format!("\n--- Dry Run Preview ({}) ---", filename));
        let done: Vec<_> = transcript
            .messages
            .iter()
            .filter_map(|m| m.translated_text.as_ref().map(|t| (m, t)))
            .collect();
        for (i, (message, translation)) in done.iter().take(5).enumerate() {
            pb.println(format!("#{:02} {} => {}", i + 1, message.text, translation));
        }
        if done.len() > 5 {
            pb.println(format!("... and {} more", done.len() - 5));
        }
        pb.println("-------------------------------\n".to_string());
    } else {
        transcript.save(path)?;
    }

    Ok(TranscriptStats {
        translated,
        failed: report.failed(),
    })
}

async fn run_translate(
    config_path: &Path,
    to: &str,
    tone: Option<&str>,
    dry_run: bool,
    text: &str,
) -> Result<()> {
    let config = AppConfig::load(config_path)?;

    if !is_supported(to) {
        warn!(language = to, "unsupported language code, passing it to the model as-is");
    }

    let tone = parse_tone(tone)?;
    let effective_tone = tone.as_ref().and_then(Tone::effective);

    let policy = config.translation.retry_policy();
    let result = if dry_run {
        translate_with_retry(&DryRunTranslator, &policy, text, to, effective_tone).await?
    } else {
        let translator = LlmTranslator::new(OpenAiTransport::new(&config.llm)?);
        translate_with_retry(&translator, &policy, text, to, effective_tone).await?
    };

    if let Some(toned) = &result.toned_original {
        println!("🎭 {}", toned);
    }
    println!("{}", result.translation);

    Ok(())
}

fn parse_tone(tone: Option<&str>) -> Result<Option<Tone>> {
    let tone = tone.map(Tone::parse);
    if let Some(reason) = tone.as_ref().and_then(|t| t.validate().error) {
        anyhow::bail!("{}", reason);
    }
    Ok(tone)
}

#[allow(clippy::too_many_arguments)]
async fn run_say(
    config_path: &Path,
    transcript_path: &Path,
    sender: Sender,
    tone: Option<&str>,
    translated: Option<String>,
    translate: bool,
    dry_run: bool,
    text: &str,
) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let mut transcript = if transcript_path.exists() {
        Transcript::load(transcript_path)?
    } else {
        Transcript::default()
    };
    let tone = parse_tone(tone)?;

    let transport = OpenAiTransport::new(&config.llm)?;
    let translator: Box<dyn Translator> = if dry_run {
        Box::new(DryRunTranslator)
    } else {
        Box::new(LlmTranslator::new(transport.clone()))
    };
    let batch = BatchTranslator::new(transport, config.translation.batch_policy());
    let session = SessionTranslator::new(batch, &config.session)
        .with_retry_policy(config.translation.retry_policy())
        .with_auto_translate(translate);

    let mut translated = translated;
    if sender == Sender::Agent && translate && translated.is_none() {
        let effective_tone = tone.as_ref().and_then(Tone::effective);
        match session
            .preview_reply(translator.as_ref(), &transcript, text, effective_tone)
            .await
        {
            Ok(preview) => {
                if let Some(toned) = &preview.toned_original {
                    println!("🎭 {}", toned);
                }
                translated = Some(preview.translation);
            }
            Err(e) => {
                println!("⚠️  Translation failed, sending the message untranslated: {}", e);
            }
        }
    }

    let id = session
        .add_message(
            translator.as_ref(),
            &mut transcript,
            text,
            sender,
            translated,
            tone.map(|t| t.to_string()),
        )
        .await;

    if let Some(message) = transcript.message(&id) {
        match &message.translated_text {
            Some(translation) => println!("💬 {} => {}", message.text, translation),
            None => println!("💬 {} (untranslated)", message.text),
        }
    }

    if dry_run {
        println!("🔍 Dry run, transcript not written");
    } else {
        transcript.save(transcript_path)?;
    }

    Ok(())
}

fn run_clear(transcript_path: &Path) -> Result<()> {
    let mut transcript = Transcript::load(transcript_path)?;
    let removed = transcript.messages.len();
    transcript.clear();
    transcript.save(transcript_path)?;
    println!("🧹 Removed {} message(s) from {}", removed, transcript_path.display());
    Ok(())
}

fn run_tone(text: &str) -> Result<()> {
    let validation = validate_tone(text);
    match validation.error {
        None => {
            println!("✅ Tone accepted: {}", text.trim());
            Ok(())
        }
        Some(reason) => {
            let presets: Vec<String> = Tone::PRESETS.iter().map(ToString::to_string).collect();
            println!("❌ {}", reason);
            println!("💡 Presets: {}", presets.join(", "));
            std::process::exit(1);
        }
    }
}
