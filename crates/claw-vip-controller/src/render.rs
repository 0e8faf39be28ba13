//! C4 — Configuration Renderer: turns a `VrrpConfig` into the keepalived
//! configuration text byte-for-byte, with no side effects.
//!
//! Grounded on the template-context pattern `shipcat_definitions` uses for
//! its own `tera` configs: a `Context::from_serialize` built straight off a
//! `Serialize` struct, rendered against a fixed, embedded template.

use tera::{Context, Tera};

use crate::error::RenderError;
use crate::types::VrrpConfig;

const TEMPLATE_NAME: &str = "keepalived.conf.tera";
const TEMPLATE_SOURCE: &str = include_str!("../templates/keepalived.conf.tera");

/// Renders `config` into the keepalived configuration file contents.
///
/// Pure and deterministic: the same `VrrpConfig` always
/// produces byte-identical output, since every collection it walks is
/// already sorted by the caller (see `sort_backends`/`sort_virtual_services`
/// in `types`).
///
/// # Errors
///
/// Returns `RenderError` if the embedded template fails to parse or the
/// context fails to serialize — both effectively unreachable in practice,
/// since the template ships with the crate and `VrrpConfig` always
/// serializes.
pub fn render(config: &VrrpConfig) -> Result<String, RenderError> {
    let mut tera = Tera::default();
    tera.add_raw_template(TEMPLATE_NAME, TEMPLATE_SOURCE)?;

    let mut context = Context::from_serialize(config)?;
    context.insert("router_id", &config.node_ip.to_string());

    Ok(tera.render(TEMPLATE_NAME, &context)?)
}
