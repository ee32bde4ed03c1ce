//! Template rendering for per-account notices.
//!
//! A template `<name>` lives in a directory as `<name>.tmpl` (plain text,
//! mandatory) and optionally `<name>.html.tmpl`. Both are loaded and
//! compiled up front so a missing or malformed template stops the run before
//! anything is staged.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use handlebars::Handlebars;
use serde_json::{json, Value};
use thiserror::Error;

use crate::aggregate::AccountBundle;
use crate::error::{NotifyError, NotifyResult};

/// Input format for outage start times, e.g. `09:00 25-06-2015`.
pub const START_TIME_FORMAT: &str = "%H:%M %d-%m-%Y";

const SUBJECT: &str = "subject";

/// Which body a template produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Plain,
    Html,
}

impl Variant {
    fn suffix(self) -> &'static str {
        match self {
            Self::Plain => "tmpl",
            Self::Html => "html.tmpl",
        }
    }
}

/// Template lookup/render failure. "Not found" is kept distinct from
/// "found but broken" so callers can fall back on the former only.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template {path} not found")]
    NotFound { path: PathBuf },

    #[error("template '{name}' failed: {message}")]
    Render { name: String, message: String },
}

impl From<TemplateError> for NotifyError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::NotFound { path } => NotifyError::TemplateNotFound { path },
            TemplateError::Render { name, message } => NotifyError::render(name, message),
        }
    }
}

/// Compiled plain and (optional) HTML variants of one template.
pub struct TemplateStore {
    name: String,
    plain: Handlebars<'static>,
    html: Option<Handlebars<'static>>,
}

impl TemplateStore {
    /// Load `<dir>/<name>.tmpl` and, if present, `<dir>/<name>.html.tmpl`.
    pub fn load(dir: &Path, name: &str) -> Result<Self, TemplateError> {
        let plain_path = dir.join(format!("{name}.{}", Variant::Plain.suffix()));
        let plain_src = read_template(&plain_path)?;

        let mut plain = Handlebars::new();
        plain.register_escape_fn(handlebars::no_escape);
        register(&mut plain, name, &plain_src)?;

        let html_path = dir.join(format!("{name}.{}", Variant::Html.suffix()));
        let html = match read_template(&html_path) {
            Ok(src) => {
                let mut reg = Handlebars::new();
                register(&mut reg, name, &src)?;
                Some(reg)
            }
            Err(TemplateError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        Ok(Self {
            name: name.to_string(),
            plain,
            html,
        })
    }

    /// Load from a template path such as `templates/outage.tmpl`.
    ///
    /// The template name is the file name up to its first `.`, so pointing at
    /// either variant selects the same template.
    pub fn from_path(path: &Path) -> Result<Self, TemplateError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(|f| f.split('.').next())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TemplateError::NotFound {
                path: path.to_path_buf(),
            })?;
        Self::load(dir, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_html(&self) -> bool {
        self.html.is_some()
    }

    /// Render one variant against `context`.
    pub fn render(&self, variant: Variant, context: &Value) -> Result<String, TemplateError> {
        let reg = match variant {
            Variant::Plain => &self.plain,
            Variant::Html => self.html.as_ref().ok_or_else(|| TemplateError::NotFound {
                path: PathBuf::from(format!("{}.{}", self.name, Variant::Html.suffix())),
            })?,
        };
        reg.render(&self.name, context)
            .map_err(|e| TemplateError::Render {
                name: self.name.clone(),
                message: e.to_string(),
            })
    }
}

fn read_template(path: &Path) -> Result<String, TemplateError> {
    match std::fs::read_to_string(path) {
        Ok(src) => Ok(src),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TemplateError::NotFound {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(TemplateError::Render {
            name: path.display().to_string(),
            message: e.to_string(),
        }),
    }
}

fn register(reg: &mut Handlebars<'static>, name: &str, src: &str) -> Result<(), TemplateError> {
    reg.register_template_string(name, src)
        .map_err(|e| TemplateError::Render {
            name: name.to_string(),
            message: e.to_string(),
        })
}

/// Run-wide values shared by every message.
#[derive(Debug, Clone, Default)]
pub struct RunParameters {
    pub start: Option<NaiveDateTime>,
    pub duration_hours: Option<u32>,
    pub timezone: String,
    pub zone: Option<String>,
    pub nodes: Vec<String>,
    /// Number of accounts notified this run.
    pub affected: usize,
}

impl RunParameters {
    /// Parse an outage start time in `HH:MM DD-MM-YYYY` form.
    pub fn parse_start(value: &str) -> NotifyResult<NaiveDateTime> {
        NaiveDateTime::parse_from_str(value.trim(), START_TIME_FORMAT).map_err(|e| {
            NotifyError::config(format!(
                "invalid start time {value:?}, expected e.g. '09:00 25-06-2015': {e}"
            ))
        })
    }

    pub fn end(&self) -> Option<NaiveDateTime> {
        match (self.start, self.duration_hours) {
            (Some(start), Some(hours)) if hours > 0 => {
                Some(start + Duration::hours(i64::from(hours)))
            }
            _ => None,
        }
    }
}

/// Message bodies, with the HTML variant present only when a template for it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bodies {
    PlainOnly { plain: String },
    PlainAndHtml { plain: String, html: String },
}

impl Bodies {
    pub fn plain(&self) -> &str {
        match self {
            Self::PlainOnly { plain } | Self::PlainAndHtml { plain, .. } => plain,
        }
    }

    pub fn html(&self) -> Option<&str> {
        match self {
            Self::PlainOnly { .. } => None,
            Self::PlainAndHtml { html, .. } => Some(html),
        }
    }

    /// The HTML body, or one derived from the plain body when no HTML template exists.
    pub fn html_or_fallback(&self) -> Cow<'_, str> {
        match self {
            Self::PlainAndHtml { html, .. } => Cow::Borrowed(html),
            Self::PlainOnly { plain } => Cow::Owned(plain_to_html(plain)),
        }
    }
}

/// Escape HTML metacharacters and turn line breaks into `<br />`.
pub fn plain_to_html(plain: &str) -> String {
    handlebars::html_escape(plain).replace('\n', "<br />\n")
}

/// A fully rendered notice for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub bodies: Bodies,
}

/// Renders account bundles into messages.
pub struct MessageRenderer {
    store: TemplateStore,
    subject: Handlebars<'static>,
}

impl MessageRenderer {
    /// Compile the subject template alongside the body templates.
    pub fn new(store: TemplateStore, subject_template: &str) -> NotifyResult<Self> {
        let mut subject = Handlebars::new();
        subject.register_escape_fn(handlebars::no_escape);
        register(&mut subject, SUBJECT, subject_template)?;
        Ok(Self { store, subject })
    }

    pub fn template_name(&self) -> &str {
        self.store.name()
    }

    /// Render `bundle`. Identical inputs always produce identical output.
    pub fn render(
        &self,
        bundle: &AccountBundle,
        params: &RunParameters,
    ) -> NotifyResult<RenderedMessage> {
        let context = message_context(bundle, params);

        let subject = self
            .subject
            .render(SUBJECT, &context)
            .map_err(|e| NotifyError::render(SUBJECT, e.to_string()))?
            .trim()
            .to_string();

        let plain = self.store.render(Variant::Plain, &context)?;
        let bodies = if self.store.has_html() {
            let html = self.store.render(Variant::Html, &context)?;
            Bodies::PlainAndHtml { plain, html }
        } else {
            Bodies::PlainOnly { plain }
        };

        Ok(RenderedMessage { subject, bodies })
    }
}

fn message_context(bundle: &AccountBundle, params: &RunParameters) -> Value {
    let duration = params.duration_hours.filter(|h| *h > 0);
    json!({
        "account": {
            "id": bundle.account.id,
            "name": bundle.account.name,
        },
        "workloads": bundle.workloads,
        "recipients": bundle.recipients,
        "zone": params.zone,
        "nodes": params.nodes,
        "start_ts": params.start.map(|t| t.format(START_TIME_FORMAT).to_string()),
        "end_ts": params.end().map(|t| t.format(START_TIME_FORMAT).to_string()),
        "days": duration.map(|h| h / 24),
        "hours": duration.map(|h| h % 24),
        "tz": params.timezone,
        "affected": params.affected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Account;
    use crate::workload::workload;
    use tempfile::tempdir;

    const PLAIN: &str = "Dear {{account.name}} users,\n\
        {{#each workloads}}- {{name}} ({{id}})\n{{/each}}\
        {{#if start_ts}}Outage starts {{start_ts}} {{tz}} for {{days}}d {{hours}}h.\n{{/if}}\
        Zone: {{zone}}";

    fn bundle() -> AccountBundle {
        AccountBundle {
            account: Account {
                id: "p1".to_string(),
                name: "genomics".to_string(),
                enabled: true,
                contact_email: None,
            },
            workloads: vec![workload("w1", "p1", "u1"), workload("w2", "p1", "u1")],
            recipients: vec!["pi@uni.edu".to_string()],
        }
    }

    fn params() -> RunParameters {
        RunParameters {
            start: Some(RunParameters::parse_start("09:00 25-06-2015").unwrap()),
            duration_hours: Some(26),
            timezone: "AEST".to_string(),
            zone: Some("melbourne-qh2".to_string()),
            nodes: vec!["cc01".to_string()],
            affected: 1,
        }
    }

    fn renderer(dir: &Path) -> MessageRenderer {
        let store = TemplateStore::load(dir, "outage").unwrap();
        MessageRenderer::new(store, "Outage for {{account.name}}").unwrap()
    }

    #[test]
    fn test_render_plain_only() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("outage.tmpl"), PLAIN).unwrap();

        let message = renderer(tmp.path()).render(&bundle(), &params()).unwrap();
        assert_eq!(message.subject, "Outage for genomics");
        assert_eq!(
            message.bodies.plain(),
            "Dear genomics users,\n- vm-w1 (w1)\n- vm-w2 (w2)\n\
             Outage starts 09:00 25-06-2015 AEST for 1d 2h.\nZone: melbourne-qh2"
        );
        assert!(message.bodies.html().is_none());
    }

    #[test]
    fn test_rendering_is_idempotent() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("outage.tmpl"), PLAIN).unwrap();
        std::fs::write(
            tmp.path().join("outage.html.tmpl"),
            "<p>{{account.name}}</p>{{#each workloads}}<li>{{name}}</li>{{/each}}",
        )
        .unwrap();

        let r = renderer(tmp.path());
        let first = r.render(&bundle(), &params()).unwrap();
        let second = r.render(&bundle(), &params()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.bodies.html(),
            Some("<p>genomics</p><li>vm-w1</li><li>vm-w2</li>")
        );
    }

    #[test]
    fn test_plain_only_template_falls_back_to_converted_html() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("notice.tmpl"), "Hello {{account.name}}\nBye").unwrap();

        let store = TemplateStore::load(tmp.path(), "notice").unwrap();
        assert!(!store.has_html());
        let r = MessageRenderer::new(store, "Notice").unwrap();
        let message = r.render(&bundle(), &params()).unwrap();

        let expected = message.bodies.plain().replace('\n', "<br />\n");
        assert_eq!(message.bodies.html_or_fallback(), expected);
        assert_eq!(message.bodies.html_or_fallback(), "Hello genomics<br />\nBye");
    }

    #[test]
    fn test_fallback_escapes_markup() {
        assert_eq!(
            plain_to_html("a < b & \"c\"\nd"),
            "a &lt; b &amp; &quot;c&quot;<br />\nd"
        );
        assert_eq!(plain_to_html("it's a=b"), "it&#x27;s a&#x3D;b");
    }

    #[test]
    fn test_missing_plain_template_is_not_found() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("outage.html.tmpl"), "<p>hi</p>").unwrap();

        let err = TemplateStore::load(tmp.path(), "outage").err().unwrap();
        assert!(matches!(err, TemplateError::NotFound { .. }));
        let err: NotifyError = err.into();
        assert!(matches!(err, NotifyError::TemplateNotFound { .. }));
    }

    #[test]
    fn test_malformed_template_is_render_error() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("broken.tmpl"), "{{#each workloads}}unclosed").unwrap();

        let err = TemplateStore::load(tmp.path(), "broken").err().unwrap();
        assert!(matches!(err, TemplateError::Render { .. }));
    }

    #[test]
    fn test_from_path_accepts_either_variant() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join("outage.tmpl"), PLAIN).unwrap();

        let store = TemplateStore::from_path(&tmp.path().join("outage.html.tmpl")).unwrap();
        assert_eq!(store.name(), "outage");
    }

    #[test]
    fn test_shipped_outage_template_renders() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../templates");
        let store = TemplateStore::load(&dir, "outage").unwrap();
        assert!(store.has_html());

        let message = MessageRenderer::new(store, "Outage")
            .unwrap()
            .render(&bundle(), &params())
            .unwrap();
        assert!(message.bodies.plain().contains("- vm-w1 (w1) on cc01"));
        assert!(message.bodies.plain().contains("09:00 25-06-2015 AEST"));
        assert!(message
            .bodies
            .html()
            .unwrap()
            .contains("<li>vm-w1 (w1) on cc01</li>"));
    }

    #[test]
    fn test_parse_start_rejects_bad_format() {
        assert!(RunParameters::parse_start("2015-06-25 09:00").is_err());
        let p = params();
        assert_eq!(
            p.end().unwrap().format(START_TIME_FORMAT).to_string(),
            "11:00 26-06-2015"
        );
    }
}
