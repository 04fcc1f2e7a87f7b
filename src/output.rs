use std::io::{self, Write};

use serde::Serialize;

use crate::app::{RegionStatus, RunResult};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn render<T: Serialize>(value: &T) -> io::Result<String> {
        serde_json::to_string_pretty(value).map_err(io::Error::other)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = Self::render(value)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// One line per region, for terminals.
pub fn print_summary(result: &RunResult) -> io::Result<()> {
    let mut stdout = io::stdout();
    for region in &result.regions {
        let detail = match region.status {
            RegionStatus::Composed | RegionStatus::Reused => region.composites.join(", "),
            RegionStatus::Fetched => {
                format!("{}/{} archives", region.acquired, region.products.len())
            }
            RegionStatus::NoProducts => "no matching products".to_string(),
            RegionStatus::Failed => region.error.clone().unwrap_or_default(),
        };
        writeln!(stdout, "{:<16} {:<11} {detail}", region.name, status_label(region.status))?;
    }
    writeln!(stdout, "downloads: {}", result.downloads)?;
    Ok(())
}

fn status_label(status: RegionStatus) -> &'static str {
    match status {
        RegionStatus::Composed => "composed",
        RegionStatus::Reused => "reused",
        RegionStatus::Fetched => "fetched",
        RegionStatus::NoProducts => "no-products",
        RegionStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::RegionResult;

    #[test]
    fn run_summary_as_json() {
        let result = RunResult {
            regions: vec![RegionResult {
                name: "Aletsch".to_string(),
                status: RegionStatus::NoProducts,
                products: Vec::new(),
                acquired: 0,
                composites: Vec::new(),
                error: None,
            }],
            downloads: 0,
        };
        let json: serde_json::Value =
            serde_json::from_str(&JsonOutput::render(&result).unwrap()).unwrap();
        assert_eq!(json["regions"][0]["name"], "Aletsch");
        assert_eq!(json["regions"][0]["status"], "no_products");
        assert_eq!(json["downloads"], 0);
    }
}
