use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use remedy_core::scheduler::Frequency;

#[derive(Subcommand)]
pub enum ScheduleSubcommand {
    /// Print the next fire times for a frequency
    Preview {
        /// minutes, hourly, daily, weekly, monthly or cron
        #[arg(long)]
        frequency: String,

        /// Minutes between runs (minutes frequency only)
        #[arg(long, default_value_t = 1)]
        interval: u32,

        /// How many fire times to print
        #[arg(long, default_value_t = 5)]
        count: usize,

        /// Start instant, RFC 3339 (default: now)
        #[arg(long)]
        from: Option<String>,
    },
}

pub fn run(subcmd: ScheduleSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ScheduleSubcommand::Preview {
            frequency,
            interval,
            count,
            from,
        } => preview(&frequency, interval, count, from.as_deref(), json),
    }
}

fn preview(
    frequency: &str,
    interval: u32,
    count: usize,
    from: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let frequency: Frequency = frequency.parse()?;
    let start = match from {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid --from '{s}'"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };
    if frequency == Frequency::Cron {
        eprintln!("[warning] cron expressions are not evaluated; cron schedules fire hourly");
    }

    let mut runs = Vec::with_capacity(count);
    let mut at = start;
    for _ in 0..count {
        at = frequency.next_run(at, interval);
        runs.push(at);
    }

    if json {
        return print_json(&serde_json::json!({
            "frequency": frequency.as_str(),
            "interval": interval,
            "from": start,
            "runs": runs,
        }));
    }

    let rows = runs
        .iter()
        .enumerate()
        .map(|(i, t)| vec![(i + 1).to_string(), t.to_rfc3339()])
        .collect();
    print_table(&["#", "NEXT RUN"], rows);
    Ok(())
}
