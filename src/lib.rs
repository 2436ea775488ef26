//! Supervised fine-tuning preprocessing: multi-turn encoding and sequence packing.
//!
//! The crate turns multi-turn dialog records into training tensors. Each record is encoded
//! into `(input_ids, labels)` with prompt masking and length budgeting, filtered, and then
//! either emitted one example per record or greedily packed into fixed-capacity blocks with
//! per-example attention-group tags.
//!
//! ```no_run
//! use sftpack::{
//!     ChatTemplate, HfTokenizer, PreprocessConfig, Preprocessor, ProportionalBudget,
//!     SpecialTokens, TemplateConfig,
//! };
//!
//! # fn main() -> sftpack::Result<()> {
//! let cfg = PreprocessConfig::builder()
//!     .cutoff_len(4096)
//!     .neat_packing(true)
//!     .show_progress(false)
//!     .build()?;
//! let tokenizer = HfTokenizer::from_file("tokenizer.json", &SpecialTokens::default())?;
//! let template = ChatTemplate::new(TemplateConfig::default())?;
//! let records = sftpack::corpus::load_records(&["data/"], Default::default())?;
//! let preprocessor = Preprocessor::new(cfg, &template, &tokenizer, &ProportionalBudget)?;
//! let output = preprocessor.run(&records)?;
//! println!("{}", output.stats);
//! # Ok(())
//! # }
//! ```
//!
//! The CLI is enabled by default through the `cli` feature. Users targeting the library
//! portion only can disable default features to avoid the CLI dependencies:
//! `sftpack = { version = "...", default-features = false }`.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    clippy::all,
    rust_2018_idioms,
    future_incompatible,
    unused_lifetimes,
    unreachable_pub
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::multiple_crate_versions
)]

pub mod block;
pub mod budget;
pub mod config;
pub mod corpus;
pub mod encoder;
pub mod error;
pub mod metrics;
pub mod packer;
pub mod pipeline;
pub mod record;
pub mod template;
pub mod tokenizer;
pub mod validate;

pub use block::{BlockEmitter, GroupId, PackedBlock, UnpackedRecord};
pub use budget::{LengthBudget, ProportionalBudget};
pub use config::{PreprocessBuilder, PreprocessConfig, Stage, TemplateConfig};
pub use encoder::{EncodePolicy, TurnEncoder};
pub use error::{Result, SftpackError};
pub use metrics::{BatchStats, PackingSummary};
pub use packer::{BiasRule, BinPacker, PackOutcome};
pub use pipeline::{PreprocessOutput, Preprocessor, ProcessedDataset};
pub use record::{EncodedExample, Label, RawRecord, Role, TokenId, Turn, IGNORE_INDEX};
pub use template::{ChatTemplate, Template};
pub use tokenizer::{HfTokenizer, SpecialTokens, TokenizerHandle};
pub use validate::{Admitted, ExampleValidator, Rejection};
