//! Namespace labelling for proxy auto-injection.

use std::collections::BTreeMap;

use meshd_apply::Applier;
use meshd_core::{INJECT_ANNOTATION, INJECT_ENABLED};
use meshd_kubehub::ResourceMapping;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::templates::{TemplateVars, Templates};
use crate::OpsError;

/// Annotate `namespace` for injection, creating it first when it does not exist.
/// Existing annotations are kept.
pub async fn label_for_injection(applier: &Applier, templates: &Templates, namespace: &str, cancel: &CancellationToken) -> Result<(), OpsError> {
    let mapping = ResourceMapping::namespaces();
    let mut ns = match applier.lookup(&mapping, None, namespace).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => {
            info!(namespace, "namespace not found; creating it");
            let yaml = templates
                .render("namespace.yaml", &TemplateVars { namespace, user_name: "" })
                .await
                .map_err(OpsError::Manifest)?;
            applier.apply_manifest(&yaml, namespace, false, cancel).await?;
            applier.lookup(&mapping, None, namespace).await?
        }
        Err(e) => return Err(e.into()),
    };
    ns.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(INJECT_ANNOTATION.to_string(), INJECT_ENABLED.to_string());
    applier.update(&mapping, &ns).await?;
    info!(namespace, "namespace labelled for injection");
    Ok(())
}
