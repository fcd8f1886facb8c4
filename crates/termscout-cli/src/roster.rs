use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use termscout_crawler::Target;

/// One roster line. Extra columns are ignored.
#[derive(Debug, Deserialize)]
struct RosterRow {
    #[serde(default, alias = "nces_id")]
    id: Option<String>,
    #[serde(alias = "school_name")]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default, alias = "website", alias = "school_website")]
    school_url: Option<String>,
    #[serde(default, alias = "district_website")]
    district_url: Option<String>,
}

impl From<RosterRow> for Target {
    fn from(row: RosterRow) -> Self {
        Self {
            id: row.id.filter(|id| !id.trim().is_empty()),
            name: row.name,
            state: row.state,
            primary_url: row.school_url,
            secondary_url: row.district_url,
        }
    }
}

pub fn read_roster(path: &Path) -> anyhow::Result<Vec<Target>> {
    let file = fs_err::File::open(path)?;
    read_targets(file).with_context(|| format!("Invalid roster {}", path.display()))
}

fn read_targets(input: impl std::io::Read) -> anyhow::Result<Vec<Target>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input);

    let mut targets = Vec::new();
    for (i, row) in rdr.deserialize::<RosterRow>().enumerate() {
        let row = row.with_context(|| format!("Line {}", i + 2))?;
        if row.name.is_empty() {
            log::warn!("Skipping roster line {} without a name", i + 2);
            continue;
        }
        targets.push(row.into());
    }
    Ok(targets)
}
