use std::collections::HashMap;
use std::path::Path;
use std::thread;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use termscout_crawler::{ResultSink, Source, TargetResult};

pub const HEADER: &[&str] = &[
    "id",
    "name",
    "state",
    "status",
    "terms_found",
    "term_counts",
    "total_occurrences",
    "primary_occurrences",
    "secondary_occurrences",
    "pages_scanned",
    "matched_urls",
    "primary_urls",
    "secondary_urls",
    "snippets",
    "failed_pages",
    "errors",
    "ai_summary",
    "completed_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Start a new report, header included
    Create,
    /// Continue the report of an interrupted run
    Append,
}

type Ack = Sender<Result<(), String>>;

/// CSV report written by a dedicated thread, one row per emitted target.
///
/// Every row is flushed before `emit` returns so that a target checkpointed
/// as done always has its row on disk. A target scanned again by a resumed
/// run gets a second row, `finish` then keeps only the last one.
pub struct CsvReport {
    tx_record: Sender<(csv::StringRecord, Ack)>,
    tx_stop: Sender<()>,
    rx_done: Receiver<()>,
}

impl CsvReport {
    pub fn open(path: &Path, mode: FileMode) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs_err::create_dir_all(dir)?;
        }
        let has_rows = fs_err::metadata(path).map_or(false, |m| m.len() > 0);

        let file = match mode {
            FileMode::Append => fs_err::OpenOptions::new().create(true).append(true).open(path)?,
            FileMode::Create => fs_err::File::create(path)?,
        };
        let mut wtr = csv::WriterBuilder::new().from_writer(file);
        if mode == FileMode::Create || !has_rows {
            wtr.write_record(HEADER)?;
            wtr.flush()?;
        }
        log::info!("Writing report to {}", path.display());

        let (tx_record, rx_record) = unbounded::<(csv::StringRecord, Ack)>();
        let (tx_stop, rx_stop) = bounded::<()>(1);
        let (tx_done, rx_done) = bounded::<()>(1);
        let path = path.to_path_buf();

        thread::spawn(move || loop {
            select! {
                recv(rx_stop) -> _ => {
                    wtr.flush().ok();
                    if let Err(e) = compact(&path) {
                        log::error!("Couldn't compact {}: {e:#}", path.display());
                    }
                    tx_done.send(()).ok();
                    break;
                },
                recv(rx_record) -> msg => {
                    let Ok((record, ack)) = msg else {
                        break;
                    };
                    let res = wtr
                        .write_record(&record)
                        .map_err(anyhow::Error::from)
                        .and_then(|_| wtr.flush().map_err(anyhow::Error::from))
                        .and_then(|_| wtr.get_ref().sync_data().map_err(anyhow::Error::from))
                        .map_err(|e| format!("{e:#}"));
                    if let Err(e) = &res {
                        log::error!("Couldn't write record: {e}");
                    }
                    ack.send(res).ok();
                }
            }
        });

        Ok(Self {
            tx_record,
            tx_stop,
            rx_done,
        })
    }

    /// Flushes pending rows, drops superseded ones and stops the writer thread.
    pub fn finish(&self) {
        self.tx_stop.send(()).ok();
        self.rx_done.recv().ok();
    }
}

/// Keeps the last row of each target id, at the position of its first row.
fn compact(path: &Path) -> anyhow::Result<()> {
    let mut rdr = csv::Reader::from_reader(fs_err::File::open(path)?);
    let mut rows: Vec<csv::StringRecord> = Vec::new();
    let mut positions = HashMap::new();
    let mut total = 0;
    for record in rdr.records() {
        let record = record?;
        total += 1;
        let id = record.get(0).unwrap_or_default().to_string();
        match positions.get(&id) {
            Some(&i) => rows[i] = record,
            None => {
                positions.insert(id, rows.len());
                rows.push(record);
            }
        }
    }
    if rows.len() == total {
        return Ok(());
    }

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut wtr = csv::Writer::from_writer(tempfile::NamedTempFile::new_in(dir)?);
    wtr.write_record(HEADER)?;
    for row in &rows {
        wtr.write_record(row)?;
    }
    let tmp = wtr.into_inner().map_err(|e| anyhow::anyhow!("{}", e.error()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

impl ResultSink for CsvReport {
    fn emit(&self, result: &TargetResult) -> anyhow::Result<()> {
        let (ack, rx_ack) = bounded(1);
        self.tx_record
            .send((to_record(result), ack))
            .map_err(|_| anyhow::anyhow!("Report writer has stopped"))?;
        match rx_ack.recv() {
            Ok(res) => res.map_err(anyhow::Error::msg),
            Err(_) => anyhow::bail!("Report writer has stopped"),
        }
    }
}

pub fn to_record(result: &TargetResult) -> csv::StringRecord {
    let term_counts = result
        .term_counts
        .iter()
        .map(|(term, count)| format!("{term}: {count}"));
    let snippets = result
        .snippets()
        .into_iter()
        .map(|(term, snippet)| format!("[{term}] {snippet}"));

    let mut record = csv::StringRecord::new();
    record.push_field(&result.target.id().to_string());
    record.push_field(&result.target.name);
    record.push_field(&result.target.state);
    record.push_field(&result.status.to_string());
    record.push_field(&join(result.terms_found(), "; "));
    record.push_field(&join(term_counts, "; "));
    record.push_field(&result.total_occurrences.to_string());
    record.push_field(&result.occurrences_from(Source::Primary).to_string());
    record.push_field(&result.occurrences_from(Source::Secondary).to_string());
    record.push_field(&result.pages_scanned.to_string());
    record.push_field(&join(&result.matched_urls, " | "));
    record.push_field(&join(result.urls_from(Source::Primary), " | "));
    record.push_field(&join(result.urls_from(Source::Secondary), " | "));
    record.push_field(&join(snippets, " || "));
    record.push_field(&result.failures.len().to_string());
    record.push_field(&join(&result.errors, "; "));
    record.push_field(result.summary.as_ref().and_then(|s| s.text()).unwrap_or_default());
    record.push_field(&result.completed_at.to_rfc3339());
    record
}

fn join<I>(items: I, sep: &str) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut out = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        out.push_str(item.as_ref());
    }
    out
}
