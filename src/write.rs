//! Transfer syntax negotiation and Part 10 file writing.
//!
//! [`finalize`] takes a composed data set through the states
//! _Negotiating_ → _Verifying_ → _Writing_ → _Done_:
//! the requested transfer syntax is resolved against the registry,
//! the data set is checked to be expressible in it,
//! and only then is the file serialized.
//! The output is first written to a temporary file
//! in the target directory and persisted by renaming,
//! so that a failed run never leaves
//! a truncated file which looks valid.
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use dicom_core::header::Header;
use dicom_core::{DataDictionary, Tag, VR};
use dicom_dictionary_std::{tags, uids, StandardDataDictionary};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{OptionExt, ResultExt, Snafu};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum FinalizeError {
    /// The requested transfer syntax is not available for writing.
    #[snafu(display("Unsupported transfer syntax {} ({})", uid, name))]
    UnsupportedTransferSyntax { uid: String, name: &'static str },

    /// An element of the data set cannot be expressed
    /// in the requested transfer syntax.
    #[snafu(display(
        "Element {} ({:?}) cannot be expressed in {}",
        tag,
        vr,
        ts_name
    ))]
    NotRepresentable {
        tag: Tag,
        vr: VR,
        ts_name: &'static str,
    },

    /// The data set is missing an attribute
    /// which is required for the file meta group.
    #[snafu(display("Missing attribute {} for the file meta group", name))]
    MissingAttribute { name: &'static str },

    /// The file meta group could not be built.
    #[snafu(display("Could not build file meta group: {}", source))]
    BuildMeta { source: dicom_object::meta::Error },

    /// The temporary output file could not be created.
    #[snafu(display("Could not create output file in {}: {}", dir.display(), source))]
    CreateOutput {
        dir: PathBuf,
        source: std::io::Error,
    },

    /// The file meta group could not be written.
    #[snafu(display("Could not write file meta group: {}", source))]
    WriteMeta { source: dicom_object::meta::Error },

    /// The data set could not be serialized.
    #[snafu(display("Could not write data set: {}", source))]
    WriteDataSet { source: dicom_object::WriteError },

    /// Raw output I/O failure.
    #[snafu(display("Could not write output file {}: {}", path.display(), source))]
    WriteOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The finished file could not be moved to its destination.
    #[snafu(display("Could not persist output file {}: {}", path.display(), source))]
    PersistOutput {
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

type Result<T, E = FinalizeError> = std::result::Result<T, E>;

/// The output encodings available for encapsulated document files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum TransferSyntaxChoice {
    /// Explicit VR Little Endian (default)
    #[default]
    #[cfg_attr(feature = "cli", value(name = "little"))]
    ExplicitVrLittleEndian,
    /// Implicit VR Little Endian
    #[cfg_attr(feature = "cli", value(name = "implicit"))]
    ImplicitVrLittleEndian,
    /// Explicit VR Big Endian (retired)
    #[cfg_attr(feature = "cli", value(name = "big"))]
    ExplicitVrBigEndian,
    /// Deflated Explicit VR Little Endian
    #[cfg_attr(feature = "cli", value(name = "deflated"))]
    DeflatedExplicitVrLittleEndian,
}

impl TransferSyntaxChoice {
    /// The transfer syntax UID of this choice.
    // Explicit VR Big Endian is retired and its UID constant
    // is deprecated upstream, but it remains a valid output encoding here
    #[allow(deprecated)]
    pub fn uid(self) -> &'static str {
        match self {
            TransferSyntaxChoice::ExplicitVrLittleEndian => uids::EXPLICIT_VR_LITTLE_ENDIAN,
            TransferSyntaxChoice::ImplicitVrLittleEndian => uids::IMPLICIT_VR_LITTLE_ENDIAN,
            TransferSyntaxChoice::ExplicitVrBigEndian => uids::EXPLICIT_VR_BIG_ENDIAN,
            TransferSyntaxChoice::DeflatedExplicitVrLittleEndian => {
                uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN
            }
        }
    }

    /// A human readable name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            TransferSyntaxChoice::ExplicitVrLittleEndian => "Explicit VR Little Endian",
            TransferSyntaxChoice::ImplicitVrLittleEndian => "Implicit VR Little Endian",
            TransferSyntaxChoice::ExplicitVrBigEndian => "Explicit VR Big Endian",
            TransferSyntaxChoice::DeflatedExplicitVrLittleEndian => {
                "Deflated Explicit VR Little Endian"
            }
        }
    }
}

/// The outcome of a successful [`finalize`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// the path of the written file
    pub path: PathBuf,
    /// total file size in bytes, meta group included
    pub bytes_written: u64,
}

/// Negotiate the output transfer syntax,
/// verify that the data set can be expressed in it,
/// and serialize the object (file meta group plus data set)
/// to the output path.
///
/// No file is created or modified when negotiation
/// or verification fails.
pub fn finalize(
    obj: &InMemDicomObject,
    choice: TransferSyntaxChoice,
    output: impl AsRef<Path>,
) -> Result<WriteResult> {
    let output = output.as_ref();

    // Negotiating
    if matches!(
        choice,
        TransferSyntaxChoice::DeflatedExplicitVrLittleEndian
    ) && cfg!(not(feature = "deflate"))
    {
        return UnsupportedTransferSyntaxSnafu {
            uid: choice.uid(),
            name: choice.name(),
        }
        .fail();
    }
    TransferSyntaxRegistry
        .get(choice.uid())
        .context(UnsupportedTransferSyntaxSnafu {
            uid: choice.uid(),
            name: choice.name(),
        })?;
    debug!("negotiated output transfer syntax {}", choice.name());

    // Verifying
    verify_writable(obj, choice)?;

    // Writing
    let sop_class_uid = required_uid(obj, tags::SOP_CLASS_UID, "SOPClassUID")?;
    let sop_instance_uid = required_uid(obj, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?;
    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(choice.uid())
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .build()
        .context(BuildMetaSnafu)?;

    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).context(CreateOutputSnafu { dir })?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        writer
            .write_all(&[0_u8; 128])
            .context(WriteOutputSnafu { path: output })?;
        writer
            .write_all(b"DICM")
            .context(WriteOutputSnafu { path: output })?;
        meta.write(&mut writer).context(WriteMetaSnafu)?;
        write_data_set(obj, choice, writer, output)?;
    }
    let bytes_written = tmp
        .as_file()
        .metadata()
        .context(WriteOutputSnafu { path: output })?
        .len();
    tmp.persist(output)
        .context(PersistOutputSnafu { path: output })?;

    debug!(
        "wrote {} bytes to {}",
        bytes_written,
        output.display()
    );
    Ok(WriteResult {
        path: output.to_owned(),
        bytes_written,
    })
}

/// Check that every element of the data set
/// can be legally expressed in the chosen encoding.
///
/// Under Implicit VR Little Endian
/// the explicit value representation of an element is lost,
/// so any element whose tag is not in the data dictionary
/// (and is not already UN) is rejected
/// rather than silently degraded.
fn verify_writable(obj: &InMemDicomObject, choice: TransferSyntaxChoice) -> Result<()> {
    if choice != TransferSyntaxChoice::ImplicitVrLittleEndian {
        return Ok(());
    }
    for elem in obj {
        if elem.vr() != VR::UN && StandardDataDictionary.by_tag(elem.tag()).is_none() {
            return NotRepresentableSnafu {
                tag: elem.tag(),
                vr: elem.vr(),
                ts_name: choice.name(),
            }
            .fail();
        }
    }
    Ok(())
}

fn write_data_set<W: Write>(
    obj: &InMemDicomObject,
    choice: TransferSyntaxChoice,
    mut writer: W,
    output: &Path,
) -> Result<()> {
    match choice {
        #[cfg(feature = "deflate")]
        TransferSyntaxChoice::DeflatedExplicitVrLittleEndian => {
            // the meta group stays uncompressed, only the data set is deflated
            let ele = TransferSyntaxRegistry
                .get(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .context(UnsupportedTransferSyntaxSnafu {
                    uid: uids::EXPLICIT_VR_LITTLE_ENDIAN,
                    name: "Explicit VR Little Endian",
                })?;
            let mut encoder =
                flate2::write::DeflateEncoder::new(writer, flate2::Compression::fast());
            obj.write_dataset_with_ts(&mut encoder, ele)
                .context(WriteDataSetSnafu)?;
            let mut writer = encoder.finish().context(WriteOutputSnafu { path: output })?;
            writer.flush().context(WriteOutputSnafu { path: output })?;
        }
        _ => {
            let ts = TransferSyntaxRegistry
                .get(choice.uid())
                .context(UnsupportedTransferSyntaxSnafu {
                    uid: choice.uid(),
                    name: choice.name(),
                })?;
            obj.write_dataset_with_ts(&mut writer, ts)
                .context(WriteDataSetSnafu)?;
            writer.flush().context(WriteOutputSnafu { path: output })?;
        }
    }
    Ok(())
}

fn required_uid(
    obj: &InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<String> {
    let value = obj
        .element(tag)
        .ok()
        .and_then(|e| e.value().to_str().ok())
        .context(MissingAttributeSnafu { name })?;
    Ok(value.trim_end_matches(['\0', ' ']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue};
    use dicom_object::open_file;

    fn minimal_object() -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.104.1"),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("2.25.1234"),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from("Doe^John"),
        ));
        obj
    }

    #[test]
    fn writes_explicit_little_endian_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dcm");
        let result = finalize(
            &minimal_object(),
            TransferSyntaxChoice::ExplicitVrLittleEndian,
            &path,
        )
        .unwrap();
        assert_eq!(result.path, path);
        assert!(result.bytes_written > 132);

        let obj = open_file(&path).unwrap();
        assert_eq!(
            obj.meta().transfer_syntax.trim_end_matches('\0'),
            "1.2.840.10008.1.2.1"
        );
        assert_eq!(
            obj.element(tags::PATIENT_NAME)
                .unwrap()
                .value()
                .to_str()
                .unwrap(),
            "Doe^John"
        );
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn deflated_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deflated.dcm");
        finalize(
            &minimal_object(),
            TransferSyntaxChoice::DeflatedExplicitVrLittleEndian,
            &path,
        )
        .unwrap();

        let obj = open_file(&path).unwrap();
        assert_eq!(
            obj.meta().transfer_syntax.trim_end_matches('\0'),
            "1.2.840.10008.1.2.1.99"
        );
        assert_eq!(
            obj.element(tags::PATIENT_NAME)
                .unwrap()
                .value()
                .to_str()
                .unwrap(),
            "Doe^John"
        );
    }

    #[test]
    fn big_endian_maps_to_the_retired_uid() {
        assert_eq!(
            TransferSyntaxChoice::ExplicitVrBigEndian.uid(),
            "1.2.840.10008.1.2.2"
        );
    }

    #[test]
    fn failed_verification_leaves_no_file() {
        let mut obj = minimal_object();
        // a private element with an explicit VR
        // cannot survive implicit VR encoding
        obj.put(DataElement::new(
            Tag(0x0009, 0x0010),
            VR::LO,
            PrimitiveValue::from("private"),
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.dcm");
        let err = finalize(&obj, TransferSyntaxChoice::ImplicitVrLittleEndian, &path)
            .expect_err("verification must fail");
        assert!(matches!(err, FinalizeError::NotRepresentable { .. }));
        assert!(!path.exists());
        // nothing else left behind either
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_sop_attributes_are_reported() {
        let obj = InMemDicomObject::new_empty();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.dcm");
        let err = finalize(&obj, TransferSyntaxChoice::ExplicitVrLittleEndian, &path)
            .expect_err("missing SOP attributes must fail");
        assert!(matches!(err, FinalizeError::MissingAttribute { .. }));
        assert!(!path.exists());
    }
}
