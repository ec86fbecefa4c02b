//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::{
    AnalyticsFilter, AnovaRequest, ChiSquareRequest, DescriptiveRequest, GroupBy, TTestRequest,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// fedstat - federated analytics over site summary statistics
///
/// Runs descriptive statistics, t-tests, chi-square tests and ANOVA across
/// the sites of a federation. Sites only ever return per-group sums and
/// counts; raw records never leave them.
///
/// Examples:
///   fedstat descriptive --federation trial --variable age --percentiles
///   fedstat ttest --federation trial --variable age --group-a ios --group-b android
///   fedstat anova --federation trial --variable age --post-hoc --filter age:gte:18
///   fedstat queries list --federation trial
///   fedstat init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .fedstat.toml in the current directory
    #[arg(short, long, global = true, value_name = "FILE", env = "FEDSTAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output file path for the report (stdout if omitted)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, global = true, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Query history file (overrides the config file)
    #[arg(long, global = true, value_name = "FILE", env = "FEDSTAT_HISTORY")]
    pub history: Option<PathBuf>,

    /// Overall query timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Per-site fetch timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub site_timeout: Option<u64>,

    /// Site fetches in flight at once
    #[arg(long, global = true, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Per-group and overall descriptive statistics of a numeric variable
    Descriptive(DescriptiveArgs),

    /// Welch two-sample t-test between two groups
    Ttest(TTestArgs),

    /// Chi-square independence test of two categorical variables
    Chisquare(ChiSquareArgs),

    /// One-way ANOVA across groups, with optional post-hoc comparisons
    Anova(AnovaArgs),

    /// Inspect query history
    #[command(subcommand)]
    Queries(QueriesCommand),

    /// Generate a default .fedstat.toml configuration file
    InitConfig,
}

#[derive(Subcommand, Debug, Clone)]
pub enum QueriesCommand {
    /// List queries of a federation, newest first
    List {
        #[arg(short, long, env = "FEDSTAT_FEDERATION")]
        federation: String,

        #[arg(long, value_name = "COUNT")]
        limit: Option<usize>,

        #[arg(long, value_name = "COUNT")]
        offset: Option<usize>,
    },

    /// Show one query with its result
    Show {
        #[arg(short, long, env = "FEDSTAT_FEDERATION")]
        federation: String,

        /// Query id
        id: Uuid,
    },
}

/// Options shared by every test command.
#[derive(ClapArgs, Debug, Clone)]
pub struct ScopeArgs {
    /// Federation to query
    #[arg(short, long, env = "FEDSTAT_FEDERATION")]
    pub federation: String,

    /// How sites are partitioned into groups
    #[arg(long, default_value = "device-group", value_name = "GROUPING")]
    pub group_by: GroupByArg,

    /// Record filter as FIELD:OP:VALUE (repeatable)
    ///
    /// VALUE is read as JSON when it parses, else as a string.
    /// Example: --filter age:gte:18 --filter 'smoker:in:["yes","no"]'
    #[arg(long = "filter", value_name = "FILTER")]
    pub filters: Vec<String>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DescriptiveArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub variable: String,

    /// Groups to include (comma-separated, all if omitted)
    #[arg(long, value_delimiter = ',')]
    pub groups: Option<Vec<String>>,

    /// Report approximate percentiles from site sketches
    #[arg(long)]
    pub percentiles: bool,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct TTestArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub variable: String,

    #[arg(long)]
    pub group_a: String,

    #[arg(long)]
    pub group_b: String,

    #[arg(long, default_value = "0.95")]
    pub confidence: f64,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ChiSquareArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub variable1: String,

    #[arg(long)]
    pub variable2: String,

    #[arg(long, value_delimiter = ',')]
    pub groups: Option<Vec<String>>,

    #[arg(long, default_value = "0.95")]
    pub confidence: f64,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct AnovaArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub variable: String,

    #[arg(long, value_delimiter = ',')]
    pub groups: Option<Vec<String>>,

    #[arg(long, default_value = "0.95")]
    pub confidence: f64,

    /// Run Tukey-Kramer comparisons when the F-test is significant
    #[arg(long)]
    pub post_hoc: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

/// Grouping as spelled on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum GroupByArg {
    DeviceGroup,
    FederationMember,
}

impl From<GroupByArg> for GroupBy {
    fn from(arg: GroupByArg) -> Self {
        match arg {
            GroupByArg::DeviceGroup => GroupBy::DeviceGroup,
            GroupByArg::FederationMember => GroupBy::FederationMember,
        }
    }
}

/// Parse `FIELD:OP:VALUE` into a wire filter.
pub fn parse_filter(raw: &str) -> Result<AnalyticsFilter, String> {
    let mut parts = raw.splitn(3, ':');
    let (Some(field), Some(operator), Some(value)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("Filter '{}' must look like FIELD:OP:VALUE", raw));
    };
    if field.is_empty() || operator.is_empty() {
        return Err(format!("Filter '{}' must look like FIELD:OP:VALUE", raw));
    }

    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok(AnalyticsFilter {
        field: field.to_string(),
        operator: operator.to_string(),
        value,
    })
}

impl ScopeArgs {
    fn parsed_filters(&self) -> Result<Option<Vec<AnalyticsFilter>>, String> {
        if self.filters.is_empty() {
            return Ok(None);
        }
        self.filters
            .iter()
            .map(|f| parse_filter(f))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

impl DescriptiveArgs {
    pub fn to_request(&self) -> Result<DescriptiveRequest, String> {
        Ok(DescriptiveRequest {
            variable: self.variable.clone(),
            group_by: self.scope.group_by.into(),
            group_ids: self.groups.clone(),
            include_percentiles: self.percentiles,
            filters: self.scope.parsed_filters()?,
        })
    }
}

impl TTestArgs {
    pub fn to_request(&self) -> Result<TTestRequest, String> {
        Ok(TTestRequest {
            variable: self.variable.clone(),
            group_a: self.group_a.clone(),
            group_b: self.group_b.clone(),
            group_by: self.scope.group_by.into(),
            confidence_level: self.confidence,
            filters: self.scope.parsed_filters()?,
        })
    }
}

impl ChiSquareArgs {
    pub fn to_request(&self) -> Result<ChiSquareRequest, String> {
        Ok(ChiSquareRequest {
            variable1: self.variable1.clone(),
            variable2: self.variable2.clone(),
            group_by: self.scope.group_by.into(),
            group_ids: self.groups.clone(),
            confidence_level: self.confidence,
            filters: self.scope.parsed_filters()?,
        })
    }
}

impl AnovaArgs {
    pub fn to_request(&self) -> Result<AnovaRequest, String> {
        Ok(AnovaRequest {
            variable: self.variable.clone(),
            group_by: self.scope.group_by.into(),
            group_ids: self.groups.clone(),
            confidence_level: self.confidence,
            post_hoc: self.post_hoc,
            filters: self.scope.parsed_filters()?,
        })
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }
        if let Some(timeout) = self.site_timeout {
            if timeout == 0 {
                return Err("Site timeout must be at least 1 second".to_string());
            }
        }
        if let Some(0) = self.concurrency {
            return Err("Concurrency must be at least 1".to_string());
        }

        let confidence = match &self.command {
            Command::Ttest(a) => Some(a.confidence),
            Command::Chisquare(a) => Some(a.confidence),
            Command::Anova(a) => Some(a.confidence),
            _ => None,
        };
        if let Some(level) = confidence {
            if !(level > 0.0 && level < 1.0) {
                return Err("Confidence level must be between 0 and 1 (exclusive)".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `--quiet` wins over a `verbose = true` config file.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("fedstat").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_ttest() {
        let args = parse(&[
            "ttest",
            "--federation",
            "trial",
            "--variable",
            "age",
            "--group-a",
            "ios",
            "--group-b",
            "android",
            "--filter",
            "age:gte:18",
        ]);
        let Command::Ttest(ref ttest) = args.command else {
            panic!("expected ttest");
        };
        let request = ttest.to_request().unwrap();
        assert_eq!(request.confidence_level, 0.95);
        assert_eq!(request.group_by, GroupBy::DeviceGroup);
        assert_eq!(request.filters.unwrap()[0].value, serde_json::json!(18));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_parse_filter() {
        let f = parse_filter("smoker:in:[\"yes\",\"no\"]").unwrap();
        assert_eq!(f.operator, "in");
        assert_eq!(f.value, serde_json::json!(["yes", "no"]));

        let f = parse_filter("region:eq:north").unwrap();
        assert_eq!(f.value, serde_json::json!("north"));

        // Only the first two colons split.
        let f = parse_filter("note:eq:a:b").unwrap();
        assert_eq!(f.value, serde_json::json!("a:b"));

        assert!(parse_filter("age:gte").is_err());
        assert!(parse_filter(":gte:1").is_err());
    }

    #[test]
    fn test_groups_are_comma_separated() {
        let args = parse(&[
            "anova",
            "-f",
            "trial",
            "--variable",
            "age",
            "--groups",
            "ios,android,web",
            "--group-by",
            "federation-member",
            "--post-hoc",
        ]);
        let Command::Anova(ref anova) = args.command else {
            panic!("expected anova");
        };
        let request = anova.to_request().unwrap();
        assert_eq!(request.group_ids.unwrap().len(), 3);
        assert_eq!(request.group_by, GroupBy::FederationMember);
        assert!(request.post_hoc);
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = parse(&["queries", "list", "--federation", "trial"]);
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_confidence() {
        let args = parse(&[
            "chisquare",
            "-f",
            "trial",
            "--variable1",
            "smoker",
            "--variable2",
            "region",
            "--confidence",
            "1.5",
        ]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = parse(&["init-config"]);
        assert_eq!(args.log_level(false), tracing::Level::INFO);
        assert_eq!(args.log_level(true), tracing::Level::DEBUG);

        args.verbose = true;
        assert_eq!(args.log_level(false), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(true), tracing::Level::ERROR);
    }
}
