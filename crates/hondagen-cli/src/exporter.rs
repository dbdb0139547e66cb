use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use chrono::{DateTime, Days, NaiveDate, Utc};
use hondagen_core::{CycleOutcome, DeviceSnapshot, GeneratorDriver, Supervisor};
use tokio::time::sleep;
use tracing::{error, warn};

pub async fn run_exporter<D: GeneratorDriver>(
    supervisor: &mut Supervisor<D>,
    output_dir: &str,
    retention_days: u64,
) -> Result<()> {
    let out_dir = PathBuf::from(output_dir);
    fs::create_dir_all(&out_dir)?;

    let mut state = ExportState::new(out_dir, retention_days)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(supervisor.next_delay()) => {
                match supervisor.run_cycle().await {
                    CycleOutcome::Snapshot(snapshot) => {
                        let due = supervisor.due_states(Utc::now().date_naive());
                        state.write_snapshot(&snapshot, due.iter().filter(|d| d.due).count())?;
                        state.maybe_prune()?;
                    }
                    CycleOutcome::Degraded => {
                        warn!(state = ?supervisor.visible_state(), "no data this cycle");
                    }
                    CycleOutcome::Failed => {
                        error!("connection failed permanently, stopping exporter");
                        break;
                    }
                }
            }
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

pub(crate) struct ExportState {
    out_dir: PathBuf,
    retention_days: u64,
    current_day: String,
    writer: BufWriter<File>,
    last_prune: Instant,
}

impl ExportState {
    pub(crate) fn new(out_dir: PathBuf, retention_days: u64) -> Result<Self> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let writer = Self::open_writer(&out_dir, &day)?;

        Ok(Self {
            out_dir,
            retention_days,
            current_day: day,
            writer,
            last_prune: Instant::now() - Duration::from_secs(3600),
        })
    }

    fn open_writer(out_dir: &Path, day: &str) -> Result<BufWriter<File>> {
        let path = out_dir.join(format!("hondagen-{day}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    fn rotate_if_needed(&mut self, ts: DateTime<Utc>) -> Result<()> {
        let day = ts.format("%Y-%m-%d").to_string();
        if day != self.current_day {
            self.writer.flush()?;
            self.writer = Self::open_writer(&self.out_dir, &day)?;
            self.current_day = day;
        }
        Ok(())
    }

    pub(crate) fn write_snapshot(
        &mut self,
        snapshot: &DeviceSnapshot,
        services_due: usize,
    ) -> Result<()> {
        self.rotate_if_needed(snapshot.ts)?;

        let exported = serde_json::json!({
            "ts": snapshot.ts,
            "unix_ms": snapshot.ts.timestamp_millis(),
            "serial": snapshot.serial,
            "model": snapshot.model.as_str(),
            "engine_running": snapshot.engine_running,
            "eco_mode": snapshot.eco_mode,
            "metrics": {
                "runtime_hours": snapshot.runtime_hours,
                "output_voltage": snapshot.output_voltage,
                "output_current": snapshot.output_current,
                "output_power": snapshot.output_power,
            },
            "fuel": snapshot.fuel,
            "engine": {
                "event": snapshot.engine_event,
                "error": snapshot.engine_error,
            },
            "services_due": services_due,
        });

        serde_json::to_writer(&mut self.writer, &exported)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        let latest_path = self.out_dir.join("latest.json");
        fs::write(latest_path, serde_json::to_vec_pretty(&exported)?)?;

        Ok(())
    }

    fn maybe_prune(&mut self) -> Result<()> {
        if self.last_prune.elapsed() < Duration::from_secs(1800) {
            return Ok(());
        }
        self.last_prune = Instant::now();

        prune_old_log_files(&self.out_dir, self.retention_days, SystemTime::now())?;

        Ok(())
    }
}

pub(crate) fn prune_old_log_files(
    out_dir: &Path,
    retention_days: u64,
    now: SystemTime,
) -> Result<()> {
    let today = DateTime::<Utc>::from(now).date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(today);

    for entry in fs::read_dir(out_dir)? {
        let entry = entry?;
        let path = entry.path();

        let Some(file_name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        let Some(date_part) = file_name
            .strip_prefix("hondagen-")
            .and_then(|v| v.strip_suffix(".jsonl"))
        else {
            continue;
        };

        let Ok(file_date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}
