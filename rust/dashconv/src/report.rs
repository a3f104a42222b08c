//! Error accumulation for manual review of a conversion run.
//!
//! The converter never fails silently on a recoverable anomaly: it records a
//! [`ConversionError`] attributed to the dashboard and panel being converted
//! at that moment. The collected records are rendered as CSV at the end of a
//! run.

use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl ErrorLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorLevel::Debug => "DEBUG",
            ErrorLevel::Info => "INFO",
            ErrorLevel::Warn => "WARN",
            ErrorLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardRef {
    pub uid: String,
    pub title: String,
    pub folder: String,
    pub updater: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PanelRef {
    pub id: String,
    pub title: String,
}

/// Identity of whatever is being converted right now. Only used to attribute
/// errors; never part of the translated output.
#[derive(Debug, Clone, Default)]
pub struct ConversionContext {
    pub dashboard: Option<DashboardRef>,
    pub panel: Option<PanelRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionError {
    pub message: String,
    pub level: ErrorLevel,
    pub notes: String,
    pub dashboard: Option<DashboardRef>,
    pub panel: Option<PanelRef>,
}

pub trait ErrorSink {
    fn push(&mut self, error: ConversionError);
}

/// In-memory sink that keeps every record for the final CSV report.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<ConversionError>,
    grafana_url: Option<String>,
    org_id: Option<String>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables deep links to the offending panel in the CSV output.
    pub fn with_links(grafana_url: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            errors: Vec::new(),
            grafana_url: Some(grafana_url.into().trim_end_matches('/').to_string()),
            org_id: Some(org_id.into()),
        }
    }

    pub fn errors(&self) -> &[ConversionError] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn link_for(&self, error: &ConversionError) -> String {
        match (&self.grafana_url, &self.org_id, &error.dashboard, &error.panel) {
            (Some(url), Some(org), Some(dashboard), Some(panel)) => format!(
                "{url}/d/{uid}?panelId={id}&editPanel={id}&fullscreen&edit&tab=alert&orgId={org}",
                uid = dashboard.uid,
                id = panel.id,
            ),
            _ => "Cannot-Calculate-Link".to_string(),
        }
    }

    pub fn to_csv(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }

        let mut lines = Vec::with_capacity(self.errors.len() + 1);
        lines.push("Message,Folder,Dashboard,Panel,ErrorLevel,Notes,Updater,Link".to_string());
        for err in &self.errors {
            let dashboard = err.dashboard.clone().unwrap_or_default();
            let panel_title = err
                .panel
                .as_ref()
                .map(|panel| panel.title.as_str())
                .unwrap_or_default();
            let link = self.link_for(err);
            let fields = [
                err.message.as_str(),
                dashboard.folder.as_str(),
                dashboard.title.as_str(),
                panel_title,
                err.level.as_str(),
                err.notes.as_str(),
                dashboard.updater.as_str(),
                link.as_str(),
            ];
            lines.push(
                fields
                    .iter()
                    .map(|field| csv_cell(field))
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        lines.join("\n")
    }
}

impl ErrorSink for ErrorCollector {
    fn push(&mut self, error: ConversionError) {
        self.errors.push(error);
    }
}

fn csv_cell(value: &str) -> String {
    value.replace([',', '\n'], "")
}

/// Context-aware front end to an [`ErrorSink`].
pub struct Reporter<'a> {
    sink: &'a mut dyn ErrorSink,
    context: ConversionContext,
}

impl<'a> Reporter<'a> {
    pub fn new(sink: &'a mut dyn ErrorSink) -> Self {
        Self {
            sink,
            context: ConversionContext::default(),
        }
    }

    pub fn context(&self) -> &ConversionContext {
        &self.context
    }

    pub fn enter_dashboard(&mut self, dashboard: DashboardRef) {
        self.context = ConversionContext {
            dashboard: Some(dashboard),
            panel: None,
        };
    }

    pub fn enter_panel(&mut self, panel: PanelRef) {
        self.context.panel = Some(panel);
    }

    pub fn leave_panel(&mut self) {
        self.context.panel = None;
    }

    pub fn add_error(&mut self, message: impl Into<String>, level: ErrorLevel, notes: impl Into<String>) {
        let message = message.into().replace(',', "-");
        let notes = notes.into();
        let dashboard = self
            .context
            .dashboard
            .as_ref()
            .map(|d| d.title.as_str())
            .unwrap_or_default();
        let panel = self
            .context
            .panel
            .as_ref()
            .map(|p| p.title.as_str())
            .unwrap_or_default();

        match level {
            ErrorLevel::Debug => debug!(dashboard, panel, notes = %notes, "{message}"),
            ErrorLevel::Info => info!(dashboard, panel, notes = %notes, "{message}"),
            ErrorLevel::Warn => warn!(dashboard, panel, notes = %notes, "{message}"),
            ErrorLevel::Error => error!(dashboard, panel, notes = %notes, "{message}"),
        }

        self.sink.push(ConversionError {
            message,
            level,
            notes,
            dashboard: self.context.dashboard.clone(),
            panel: self.context.panel.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dashboard() -> DashboardRef {
        DashboardRef {
            uid: "abc".into(),
            title: "Hosts, all".into(),
            folder: "Infra".into(),
            updater: "admin".into(),
        }
    }

    #[test]
    fn records_are_attributed_to_active_context() {
        let mut collector = ErrorCollector::new();
        {
            let mut reporter = Reporter::new(&mut collector);
            reporter.enter_dashboard(dashboard());
            reporter.add_error("templating warning", ErrorLevel::Warn, "");
            reporter.enter_panel(PanelRef {
                id: "4".into(),
                title: "CPU".into(),
            });
            reporter.add_error("Unable to convert, bad query", ErrorLevel::Error, "notes");
        }

        let errors = collector.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].panel.is_none());
        assert_eq!(errors[1].panel.as_ref().map(|p| p.id.as_str()), Some("4"));
        assert_eq!(errors[1].message, "Unable to convert- bad query");
    }

    #[test]
    fn csv_strips_commas_and_builds_links() {
        let mut collector = ErrorCollector::with_links("https://grafana.example/", "2");
        {
            let mut reporter = Reporter::new(&mut collector);
            reporter.enter_dashboard(dashboard());
            reporter.enter_panel(PanelRef {
                id: "7".into(),
                title: "Load".into(),
            });
            reporter.add_error("Unsupported fills", ErrorLevel::Info, "previous, none");
        }

        let csv = collector.to_csv();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("Message,Folder,Dashboard,Panel,ErrorLevel,Notes,Updater,Link")
        );
        assert_eq!(
            lines.next(),
            Some("Unsupported fills,Infra,Hosts all,Load,INFO,previous none,admin,https://grafana.example/d/abc?panelId=7&editPanel=7&fullscreen&edit&tab=alert&orgId=2")
        );
    }

    #[test]
    fn missing_link_configuration_is_reported() {
        let collector = ErrorCollector::new();
        let err = ConversionError {
            message: "m".into(),
            level: ErrorLevel::Info,
            notes: String::new(),
            dashboard: None,
            panel: None,
        };
        assert_eq!(collector.link_for(&err), "Cannot-Calculate-Link");
        assert!(collector.to_csv().is_empty());
    }
}
