//! Checkpoint conversion between the Dolomite layout and HuggingFace formats
//!
//! Supported external formats are `gpt_bigcode`, `granite` and `llama`.
//! Conversion is a pure mapping over configurations and tensor dictionaries
//! ([`FormatAdapter`]) wrapped in checkpoint directory IO ([`checkpoint`]).
//!
//! ```no_run
//! use dolomite_convert::{export_to_external, import_from_external};
//!
//! # fn main() -> dolomite::Result<()> {
//! import_from_external("bigcode/gpt_bigcode-santacoder", "santacoder-dolomite")?;
//! export_to_external("santacoder-dolomite", "santacoder-hf", "gpt_bigcode")?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod attention;
pub mod checkpoint;
pub mod driver;
pub mod layout;
pub mod options;
pub mod registry;
pub mod source;
pub mod tensor;

pub use driver::{
    export_checkpoint, export_to_external, export_with_options, import_checkpoint,
    import_from_external, import_with_options, import_with_resolver,
};
pub use options::ConversionOptions;
pub use registry::{resolve_export, resolve_import, FormatAdapter, ModelType};
pub use source::{DefaultResolver, HubResolver, LocalResolver, SourceResolver};
pub use tensor::StateDict;
