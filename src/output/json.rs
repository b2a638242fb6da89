use super::RunReport;
use anyhow::Result;

pub fn format_json(report: &RunReport<'_>) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn print_json(report: &RunReport<'_>) -> Result<()> {
    println!("{}", format_json(report)?);
    Ok(())
}
