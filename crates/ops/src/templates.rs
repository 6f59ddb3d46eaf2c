//! Sample manifest templates with `{{.namespace}}` / `{{.user_name}}` placeholders.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

const BUILTIN: &[(&str, &str)] = &[
    ("httpbin.yaml", include_str!("../templates/httpbin.yaml")),
    ("bookinfo.yaml", include_str!("../templates/bookinfo.yaml")),
    ("namespace.yaml", include_str!("../templates/namespace.yaml")),
];

static PLACEHOLDER: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}"));

/// Values substituted into a template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars<'a> {
    pub namespace: &'a str,
    pub user_name: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct Templates {
    dir: Option<PathBuf>,
}

impl Templates {
    /// Built-in templates, each overridable by a same-named file in `dir`.
    pub fn new(dir: Option<PathBuf>) -> Self { Self { dir } }

    async fn source(&self, name: &str) -> Result<String> {
        if let Some(dir) = &self.dir {
            let path = dir.join(name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!(path = %path.display(), "using template override");
                return tokio::fs::read_to_string(&path).await.with_context(|| format!("reading template {}", path.display()));
            }
        }
        BUILTIN
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, body)| body.to_string())
            .ok_or_else(|| anyhow!("unknown template {}", name))
    }

    pub async fn render(&self, name: &str, vars: &TemplateVars<'_>) -> Result<String> {
        let text = self.source(name).await?;
        render_str(&text, vars).with_context(|| format!("rendering template {}", name))
    }
}

pub fn render_str(text: &str, vars: &TemplateVars<'_>) -> Result<String> {
    let re = PLACEHOLDER.as_ref().map_err(|e| anyhow!("placeholder pattern: {}", e))?;
    if let Some(bad) = re.captures_iter(text).map(|c| c[1].to_string()).find(|k| k != "namespace" && k != "user_name") {
        bail!("no value for placeholder .{}", bad);
    }
    let out = re.replace_all(text, |c: &regex::Captures<'_>| match &c[1] {
        "namespace" => vars.namespace.to_string(),
        _ => vars.user_name.to_string(),
    });
    Ok(out.into_owned())
}
