pub mod app;
pub mod batch;
pub mod config;
pub mod dashboard;
pub mod datasource;
pub mod duration;
pub mod error;
pub mod influxql;
pub mod panel;
pub mod promql;
pub mod registry;
pub mod report;
pub mod rewrite;
pub mod telemetry;
pub mod templating;
pub mod usage;

pub use crate::{
    dashboard::{ConvertedDashboard, DashboardConverter, DashboardMeta},
    error::{ConvertError, Result},
    registry::{Converter, ConverterRegistry},
    usage::MetricUsageIndex,
};

use crate::{app::App, config::AppConfig};

/// Runs one conversion pass using environment configuration.
pub fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    App::new(config)?.run()
}
