use crate::{
    batch::{self, load_envelopes},
    config::AppConfig,
    datasource::DatasourceRegistry,
    registry::{Converter, ConverterRegistry},
    report::ErrorCollector,
};
use anyhow::{anyhow, Context};
use serde::Serialize;
use std::{fs, path::Path};
use tracing::{info, warn};

pub struct App {
    config: AppConfig,
    converter: Box<dyn Converter>,
}

impl App {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let datasources = match &config.datasources_file {
            Some(path) => {
                let body = read(path)?;
                DatasourceRegistry::from_json(&body)
                    .with_context(|| format!("invalid datasources file {}", path.display()))?
            }
            None => {
                warn!("no datasources file configured; only explicitly typed targets will convert");
                DatasourceRegistry::default()
            }
        };

        let registry = ConverterRegistry::with_defaults();
        let converter = registry
            .create(&config.converter, config.converter_config.clone(), datasources)
            .ok_or_else(|| {
                anyhow!(
                    "unknown converter {:?}; available: {}",
                    config.converter,
                    registry.names().join(", ")
                )
            })?;

        Ok(Self { config, converter })
    }

    pub fn run(self) -> anyhow::Result<()> {
        let body = read(&self.config.input)?;
        let envelopes = load_envelopes(&body)
            .with_context(|| format!("invalid dashboards file {}", self.config.input.display()))?;

        let mut collector = match (&self.config.grafana_url, &self.config.grafana_org_id) {
            (Some(url), Some(org)) => ErrorCollector::with_links(url.as_str(), org.as_str()),
            _ => ErrorCollector::new(),
        };
        let outcome = batch::run(self.converter.as_ref(), envelopes, &mut collector);

        write_json(&self.config.output, &outcome.dashboards)?;
        write_json(&self.config.usage_output, &outcome.usage)?;
        write_json(&self.config.report_output, &outcome.report)?;
        fs::write(&self.config.errors_csv, collector.to_csv()).with_context(|| {
            format!("failed to write {}", self.config.errors_csv.display())
        })?;

        info!(
            output = %self.config.output.display(),
            errors = collector.errors().len(),
            "wrote conversion results"
        );
        Ok(())
    }
}

fn read(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

