//! Entry points for converting checkpoints in either direction

use dolomite::{Error, Result};
use serde_json::Value;
use std::path::Path;
use tracing::{info, instrument};

use crate::options::ConversionOptions;
use crate::registry::{resolve_export, resolve_import};
use crate::source::{DefaultResolver, LocalResolver, SourceResolver};

/// Import an external checkpoint (local directory or hub id) into an
/// internal checkpoint at `destination`.
///
/// The format is detected from the source's `config.json` `model_type`. An
/// unsupported format fails before anything is written to `destination`.
pub fn import_from_external(source_identifier: &str, destination: impl AsRef<Path>) -> Result<()> {
    import_with_options(source_identifier, destination, &ConversionOptions::default())
}

/// [`import_from_external`] with explicit options
pub fn import_with_options(
    source_identifier: &str,
    destination: impl AsRef<Path>,
    options: &ConversionOptions,
) -> Result<()> {
    let resolver = DefaultResolver::new(options);
    import_with_resolver(source_identifier, destination, &resolver, options)
}

/// [`import_from_external`] through a caller-supplied resolver
#[instrument(skip_all, fields(source = source_identifier))]
pub fn import_with_resolver(
    source_identifier: &str,
    destination: impl AsRef<Path>,
    resolver: &dyn SourceResolver,
    options: &ConversionOptions,
) -> Result<()> {
    options.validate()?;

    let config_path = resolver.config_path(source_identifier)?;
    let config: Value = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
    let tag = config
        .get("model_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::missing_configuration("model_type"))?;
    let adapter = resolve_import(tag)?;
    info!(format = tag, "detected source format");

    let source = resolver.checkpoint_dir(source_identifier)?;
    adapter.import(&source, destination.as_ref(), options)
}

/// Import the external checkpoint stored in the local directory `source`
pub fn import_checkpoint(source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<()> {
    let source = source.as_ref();
    let identifier = source
        .to_str()
        .ok_or_else(|| Error::checkpoint(format!("non UTF-8 path {}", source.display())))?;
    import_with_resolver(identifier, destination, &LocalResolver, &ConversionOptions::default())
}

/// Export the internal checkpoint at `source` to `format_tag`
pub fn export_checkpoint(
    source: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    format_tag: &str,
) -> Result<()> {
    export_to_external(source, destination, format_tag)
}

/// Export the internal checkpoint at `source_path` to the format named by
/// `format_tag`, written to `destination`.
///
/// An unsupported tag fails before anything is read or written.
pub fn export_to_external(
    source_path: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    format_tag: &str,
) -> Result<()> {
    export_with_options(source_path, destination, format_tag, &ConversionOptions::default())
}

/// [`export_to_external`] with explicit options
#[instrument(skip_all, fields(format = format_tag))]
pub fn export_with_options(
    source_path: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    format_tag: &str,
    options: &ConversionOptions,
) -> Result<()> {
    options.validate()?;
    let adapter = resolve_export(format_tag)?;
    adapter.export(source_path.as_ref(), destination.as_ref(), options)
}
