//! Run configuration: clap arguments with environment fallbacks, turned
//! into an explicit [`ExportConfig`] for the pipeline.

use std::collections::BTreeMap;

use clap::Args;

use crate::models::field_name;

#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Postgres connection string for the LMS tables
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Program whose enrolled learners are exported
    #[arg(long, env = "PROGRAM_CODE", default_value = "FS", global = true)]
    pub program_code: String,

    /// Syllabus feed: an http(s) URL or a path to a JSON file
    #[arg(long, env = "SYLLABUS_URL", global = true)]
    pub syllabus_url: Option<String>,

    /// Endpoint receiving the HTTP export
    #[arg(long, env = "EXPORT_ENDPOINT", global = true)]
    pub export_endpoint: Option<String>,

    /// Days counted as "recent" for completed fractions
    #[arg(long, env = "WINDOW_DAYS", default_value_t = 14, global = true)]
    pub window_days: i64,

    /// Days counted for the recent unit total
    #[arg(long, env = "UNIT_WINDOW_DAYS", default_value_t = 30, global = true)]
    pub unit_window_days: i64,

    /// Extra weight added to a module's total, as `module=fraction`
    #[arg(
        long = "project-fraction",
        env = "PROJECT_FRACTIONS",
        value_delimiter = ',',
        value_parser = parse_project_fraction,
        global = true
    )]
    pub project_fractions: Vec<(String, f64)>,

    /// Log filter (trace, debug, info, warn, error or a RUST_LOG directive)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,
}

impl Settings {
    pub fn export_config(&self, limit: Option<usize>) -> ExportConfig {
        ExportConfig {
            window_days: self.window_days.max(1),
            unit_window_days: self.unit_window_days.max(1),
            project_fractions: self
                .project_fractions
                .iter()
                .map(|(module, fraction)| (field_name(module), *fraction))
                .collect(),
            limit,
        }
    }
}

/// Everything the aggregation needs besides its data.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportConfig {
    pub window_days: i64,
    pub unit_window_days: i64,
    /// Keyed by module field name.
    pub project_fractions: BTreeMap<String, f64>,
    pub limit: Option<usize>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            window_days: 14,
            unit_window_days: 30,
            project_fractions: BTreeMap::new(),
            limit: None,
        }
    }
}

impl ExportConfig {
    pub fn project_fraction(&self, module: &str) -> f64 {
        self.project_fractions
            .get(&field_name(module))
            .copied()
            .unwrap_or(0.0)
    }
}

fn parse_project_fraction(value: &str) -> Result<(String, f64), String> {
    let (module, fraction) = value
        .split_once('=')
        .ok_or_else(|| format!("expected module=fraction, got `{value}`"))?;
    let fraction: f64 = fraction
        .trim()
        .parse()
        .map_err(|err| format!("invalid fraction `{fraction}`: {err}"))?;
    Ok((module.trim().to_string(), fraction))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_project_fractions() {
        assert_eq!(
            parse_project_fraction("Data Centric Development=0.07").unwrap(),
            ("Data Centric Development".to_string(), 0.07)
        );
        assert!(parse_project_fraction("no-separator").is_err());
        assert!(parse_project_fraction("m=abc").is_err());
    }

    #[test]
    fn project_fractions_match_by_field_name() {
        let mut config = ExportConfig::default();
        config
            .project_fractions
            .insert(field_name("Interactive Frontend Development"), 0.06);
        assert_eq!(config.project_fraction("Interactive Frontend Development"), 0.06);
        assert_eq!(config.project_fraction("interactive frontend development"), 0.06);
        assert_eq!(config.project_fraction("Careers"), 0.0);
    }
}
