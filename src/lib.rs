//! DICOM encapsulated document library
//!
//! This is a library for wrapping arbitrary documents
//! (PDF, CDA, or STL)
//! into DICOM _Encapsulated Document_ composite objects
//! and saving them as standard DICOM files.
//! The document content is treated as an opaque byte payload:
//! it is never parsed, validated, or transcoded.
//!
//! The pipeline has five stages,
//! each usable on its own:
//!
//! 1. [`IdentifierSet::generate`](identifiers::IdentifierSet::generate)
//!    creates the unique identifiers of the new instance,
//!    optionally extending an existing series;
//! 2. [`load_document`](loader::load_document)
//!    reads the source document into memory;
//! 3. [`encapsulate`](encap::encapsulate)
//!    composes the full data set around the payload;
//! 4. [`apply_overrides`](overrides::apply_overrides)
//!    forces caller-chosen attribute values onto the data set;
//! 5. [`finalize`](write::finalize)
//!    negotiates the output transfer syntax
//!    and writes the DICOM file atomically.
//!
//! # Example
//!
//! ```no_run
//! use dicom_encapdoc::EncapsulationRequest;
//!
//! let result = EncapsulationRequest::new("report.pdf", "report.dcm").run()?;
//! println!("{} bytes written", result.bytes_written);
//! # Result::<(), dicom_encapdoc::Error>::Ok(())
//! ```
pub mod encap;
pub mod identifiers;
pub mod loader;
pub mod overrides;
pub mod write;

use std::path::PathBuf;

use snafu::{ResultExt, Snafu};

pub use crate::encap::{
    encapsulate, CodedEntry, DocumentKind, EncapOptions, EquipmentInfo, PatientData,
};
pub use crate::identifiers::{IdentifierSet, SeriesContext};
pub use crate::loader::{load_document, DocumentPayload};
pub use crate::overrides::{apply_overrides, OverrideKey};
pub use crate::write::{finalize, TransferSyntaxChoice, WriteResult};

/// An error from any stage of the encapsulation pipeline.
#[derive(Debug, Snafu)]
pub enum Error {
    /// Could not generate instance identifiers
    #[snafu(display("Could not generate instance identifiers: {}", source))]
    Identifiers {
        source: identifiers::IdentifierError,
    },

    /// Could not load the source document
    #[snafu(display("Could not load source document: {}", source))]
    Load { source: loader::LoadError },

    /// Could not compose the data set
    #[snafu(display("Could not compose data set: {}", source))]
    Composition { source: encap::CompositionError },

    /// Could not apply an override directive
    #[snafu(display("Could not apply override: {}", source))]
    Override { source: overrides::OverrideError },

    /// Could not write the output file
    #[snafu(display("Could not write output: {}", source))]
    Finalize { source: write::FinalizeError },
}

/// A full encapsulation pipeline run, from source document to DICOM file.
///
/// This is a convenience front end over the individual stages
/// for the common case of one document in, one file out.
#[derive(Debug, Clone)]
pub struct EncapsulationRequest {
    /// path to the source document
    pub document: PathBuf,
    /// path of the DICOM file to create
    pub output: PathBuf,
    pub patient: PatientData,
    pub options: EncapOptions,
    /// series to extend, if any
    pub series_context: Option<SeriesContext>,
    /// override directives, applied in order after composition
    pub overrides: Vec<OverrideKey>,
    pub transfer_syntax: TransferSyntaxChoice,
}

impl EncapsulationRequest {
    /// Create a request with default options,
    /// inferring the document kind from the source file extension
    /// (PDF when unknown).
    pub fn new(document: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        let document = document.into();
        let kind = DocumentKind::from_extension(&document).unwrap_or_default();
        EncapsulationRequest {
            document,
            output: output.into(),
            patient: PatientData::default(),
            options: EncapOptions::new(kind),
            series_context: None,
            overrides: Vec::new(),
            transfer_syntax: TransferSyntaxChoice::default(),
        }
    }

    /// Run the whole pipeline.
    pub fn run(self) -> Result<WriteResult, Error> {
        let ids = IdentifierSet::generate(
            self.options.kind.sop_class_uid(),
            self.series_context.as_ref(),
        )
        .context(IdentifiersSnafu)?;
        let payload = load_document(&self.document).context(LoadSnafu)?;
        let mut obj =
            encapsulate(&ids, payload, &self.patient, &self.options).context(CompositionSnafu)?;
        apply_overrides(&mut obj, &self.overrides).context(OverrideSnafu)?;
        finalize(&obj, self.transfer_syntax, &self.output).context(FinalizeSnafu)
    }
}
