use chrono::Local;
use nu_ansi_term::{Color, Style};
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::{EnvFilter, Targets},
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    Layer,
};

/// Log target for per-transaction outcomes. Always shown on the console.
pub const RESULT_TARGET: &str = "spam_result";

#[derive(Debug, Clone)]
pub struct LoggerOptions {
    /// Directory for the hourly rolling log files.
    pub log_dir: String,
    pub file_prefix: String,
    /// Show INFO and DEBUG events of `app_target` on the console.
    pub verbose: bool,
    pub app_target: String,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            file_prefix: "spammer".to_string(),
            verbose: false,
            app_target: "tangle_spammer".to_string(),
        }
    }
}

/// Install the global subscriber: colored console output plus an hourly
/// rolling file. The returned guard flushes the file writer on drop and
/// must be kept alive by the caller.
///
/// `RUST_LOG`, when set, replaces the console filter.
pub fn setup_logger(options: LoggerOptions) -> Option<WorkerGuard> {
    std::fs::create_dir_all(&options.log_dir).ok();

    let file_appender = tracing_appender::rolling::hourly(&options.log_dir, &options.file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let app_level = if options.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // File: results and the engine's own INFO, WARN for dependencies
    let file_filter = Targets::new()
        .with_target(RESULT_TARGET, Level::INFO)
        .with_target(options.app_target.clone(), app_level)
        .with_default(Level::WARN);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(FileFormatter)
        .with_filter(file_filter);

    let env_filter = EnvFilter::try_from_default_env().ok();

    // Console: results always, engine chatter only when verbose
    let console_targets = if options.verbose {
        Targets::new()
            .with_target(RESULT_TARGET, Level::INFO)
            .with_target(options.app_target.clone(), app_level)
            .with_default(Level::WARN)
    } else {
        Targets::new()
            .with_target(RESULT_TARGET, Level::INFO)
            .with_default(Level::WARN)
    };

    let console_layer = match env_filter {
        Some(filter) => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .event_format(TerminalFormatter)
            .with_filter(filter)
            .boxed(),
        None => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .event_format(TerminalFormatter)
            .with_filter(console_targets)
            .boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init();

    match installed {
        Ok(()) => Some(guard),
        // Already installed (tests, embedding): keep the existing one
        Err(_) => None,
    }
}

// --- Formatters ---

struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

fn event_message(event: &Event<'_>) -> String {
    let mut msg_visitor = MessageVisitor {
        message: String::new(),
    };
    event.record(&mut msg_visitor);
    msg_visitor.message
}

pub struct TerminalFormatter;

impl<S, N> FormatEvent<S, N> for TerminalFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let msg = event_message(event);

        let colored_msg = if msg.contains("SUCCESS") {
            let green_text = Style::new().fg(Color::LightGreen).bold();
            msg.replace("SUCCESS", &format!("{}", green_text.paint("SUCCESS")))
        } else if msg.contains("FAILED") {
            let red_text = Style::new().fg(Color::LightRed).bold();
            msg.replace("FAILED", &format!("{}", red_text.paint("FAILED")))
        } else {
            msg
        };

        let level = *event.metadata().level();
        let time = Style::new()
            .dimmed()
            .paint(Local::now().format("%H:%M:%S").to_string());
        if level == Level::ERROR {
            write!(writer, "{} {} ", time, Color::Red.bold().paint("ERROR"))?;
        } else if level == Level::WARN {
            write!(writer, "{} {} ", time, Color::Yellow.paint("WARN"))?;
        } else {
            write!(writer, "{} ", time)?;
        }

        write!(writer, "{}", colored_msg)?;
        writeln!(writer)
    }
}

pub struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let level = event.metadata().level();

        write!(writer, "{} [{}] ", timestamp, level)?;
        writeln!(writer, "{}", event_message(event))
    }
}
