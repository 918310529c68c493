//! Composition of the encapsulated document data set.
//!
//! [`encapsulate`] builds a complete in-memory DICOM object
//! for the Encapsulated Document information object definition:
//! the Patient, General Study, Encapsulated Document Series,
//! General Equipment, SOP Common and Encapsulated Document modules.
//! Attribute values are resolved in priority order
//! from the caller-supplied metadata,
//! then from the generated identifier set,
//! then from deterministic defaults
//! (type 2 attributes are emitted empty when nothing else applies).
use std::path::Path;

use chrono::Local;
use dicom_core::value::DataSetSequence;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use snafu::{ensure, OptionExt, Snafu};

use crate::identifiers::{new_uid, IdentifierSet};
use crate::loader::DocumentPayload;

#[derive(Debug, Snafu)]
pub enum CompositionError {
    /// No MIME type could be resolved for the encapsulated document.
    #[snafu(display("No MIME type available for the encapsulated document"))]
    MissingMimeType,

    /// A caller-supplied value does not fit
    /// the value representation of its attribute.
    #[snafu(display("Value of {} is too long ({} chars, maximum is {})", name, len, max))]
    ValueTooLong {
        name: &'static str,
        len: usize,
        max: usize,
    },

    /// A mandatory equipment attribute has no value and no default.
    #[snafu(display("Missing mandatory equipment attribute {}", name))]
    MissingEquipment { name: &'static str },
}

type Result<T, E = CompositionError> = std::result::Result<T, E>;

/// The kind of document being encapsulated,
/// determining the SOP class and the default MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum DocumentKind {
    /// Encapsulated PDF Storage
    #[default]
    Pdf,
    /// Encapsulated CDA Storage
    Cda,
    /// Encapsulated STL Storage
    Stl,
}

impl DocumentKind {
    /// The SOP class UID of the composite object for this document kind.
    pub fn sop_class_uid(self) -> &'static str {
        match self {
            DocumentKind::Pdf => uids::ENCAPSULATED_PDF_STORAGE,
            DocumentKind::Cda => uids::ENCAPSULATED_CDA_STORAGE,
            DocumentKind::Stl => uids::ENCAPSULATED_STL_STORAGE,
        }
    }

    /// The default MIME type for this document kind.
    pub fn mime_type(self) -> &'static str {
        match self {
            DocumentKind::Pdf => "application/pdf",
            DocumentKind::Cda => "text/XML",
            DocumentKind::Stl => "model/stl",
        }
    }

    /// Guess the document kind from a source file extension.
    pub fn from_extension(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "xml" | "cda" => Some(DocumentKind::Cda),
            "stl" => Some(DocumentKind::Stl),
            _ => None,
        }
    }
}

/// Patient identity attributes.
///
/// All fields are optional;
/// absent fields are written as empty type 2 attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientData {
    pub name: Option<String>,
    pub id: Option<String>,
    pub birth_date: Option<String>,
    pub sex: Option<String>,
}

impl PatientData {
    /// Extract patient identity attributes from an existing data set,
    /// e.g. the instance providing the series context.
    pub fn from_object<D>(obj: &InMemDicomObject<D>) -> Self
    where
        D: dicom_core::dictionary::DataDictionary + Clone,
    {
        let text = |tag| {
            obj.element(tag).ok().and_then(|e| {
                let v = e.value().to_str().ok()?;
                let v = v.trim_end_matches(['\0', ' ']);
                (!v.is_empty()).then(|| v.to_string())
            })
        };
        PatientData {
            name: text(tags::PATIENT_NAME),
            id: text(tags::PATIENT_ID),
            birth_date: text(tags::PATIENT_BIRTH_DATE),
            sex: text(tags::PATIENT_SEX),
        }
    }

    /// Merge with a fallback source, keeping the values of `self`.
    pub fn or(self, fallback: PatientData) -> PatientData {
        PatientData {
            name: self.name.or(fallback.name),
            id: self.id.or(fallback.id),
            birth_date: self.birth_date.or(fallback.birth_date),
            sex: self.sex.or(fallback.sex),
        }
    }
}

/// A coded entry for the Concept Name Code Sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedEntry {
    pub code_value: String,
    pub coding_scheme: String,
    pub code_meaning: String,
}

/// Equipment attributes.
///
/// Only the manufacturer is used for PDF and CDA objects (type 2).
/// For STL objects the whole set is mandatory (Enhanced General Equipment).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EquipmentInfo {
    pub manufacturer: Option<String>,
    pub manufacturer_model_name: Option<String>,
    pub device_serial_number: Option<String>,
    pub software_versions: Option<String>,
}

/// Options controlling the composition of the data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapOptions {
    pub kind: DocumentKind,
    /// Document Title (empty if absent)
    pub document_title: Option<String>,
    /// single item for the Concept Name Code Sequence
    pub concept_name: Option<CodedEntry>,
    /// explicit MIME type, taking precedence over the payload hint
    pub mime_type: Option<String>,
    /// whether the document contains burned-in identifying annotations
    pub burned_in_annotation: bool,
    pub equipment: EquipmentInfo,
}

impl Default for EncapOptions {
    fn default() -> Self {
        EncapOptions {
            kind: DocumentKind::default(),
            document_title: None,
            concept_name: None,
            mime_type: None,
            // assume identifying annotations unless stated otherwise
            burned_in_annotation: true,
            equipment: EquipmentInfo::default(),
        }
    }
}

impl EncapOptions {
    pub fn new(kind: DocumentKind) -> Self {
        EncapOptions {
            kind,
            ..EncapOptions::default()
        }
    }
}

/// Build the composite data set for one encapsulated document.
///
/// The payload bytes are embedded as-is,
/// except for a single trailing zero octet
/// appended when the byte length is odd,
/// so that the element value keeps the even length
/// required by the encoding rules.
pub fn encapsulate(
    ids: &IdentifierSet,
    payload: DocumentPayload,
    patient: &PatientData,
    options: &EncapOptions,
) -> Result<InMemDicomObject> {
    let mime_type = options
        .mime_type
        .as_deref()
        .or_else(|| payload.mime_type())
        .unwrap_or_else(|| options.kind.mime_type());
    ensure!(!mime_type.trim().is_empty(), MissingMimeTypeSnafu);
    check_len("MIMETypeOfEncapsulatedDocument", mime_type, 64)?;
    if let Some(title) = &options.document_title {
        check_len("DocumentTitle", title, 1024)?;
    }
    if let Some(concept) = &options.concept_name {
        check_len("CodeValue", &concept.code_value, 16)?;
        check_len("CodingSchemeDesignator", &concept.coding_scheme, 16)?;
        check_len("CodeMeaning", &concept.code_meaning, 64)?;
    }

    let now = Local::now();
    let date = now.format("%Y%m%d").to_string();
    let time = now.format("%H%M%S").to_string();

    let mut obj = InMemDicomObject::new_empty();

    // SOP Common
    obj.put(DataElement::new(
        tags::SPECIFIC_CHARACTER_SET,
        VR::CS,
        PrimitiveValue::from("ISO_IR 100"),
    ));
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(ids.sop_class_uid.as_str()),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(ids.sop_instance_uid.as_str()),
    ));

    // Patient
    put_string_or_empty(&mut obj, tags::PATIENT_NAME, VR::PN, &patient.name);
    put_string_or_empty(&mut obj, tags::PATIENT_ID, VR::LO, &patient.id);
    put_string_or_empty(&mut obj, tags::PATIENT_BIRTH_DATE, VR::DA, &patient.birth_date);
    put_string_or_empty(&mut obj, tags::PATIENT_SEX, VR::CS, &patient.sex);

    // General Study
    obj.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(ids.study_instance_uid.as_str()),
    ));
    obj.put(DataElement::new(
        tags::STUDY_DATE,
        VR::DA,
        PrimitiveValue::from(date),
    ));
    obj.put(DataElement::new(
        tags::STUDY_TIME,
        VR::TM,
        PrimitiveValue::from(time),
    ));
    obj.put(DataElement::new(
        tags::REFERRING_PHYSICIAN_NAME,
        VR::PN,
        PrimitiveValue::Empty,
    ));
    obj.put(DataElement::new(tags::STUDY_ID, VR::SH, PrimitiveValue::Empty));
    obj.put(DataElement::new(
        tags::ACCESSION_NUMBER,
        VR::SH,
        PrimitiveValue::Empty,
    ));

    // Encapsulated Document Series
    obj.put(DataElement::new(
        tags::MODALITY,
        VR::CS,
        PrimitiveValue::from("DOC"),
    ));
    obj.put(DataElement::new(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(ids.series_instance_uid.as_str()),
    ));
    obj.put(DataElement::new(
        tags::SERIES_NUMBER,
        VR::IS,
        PrimitiveValue::from("1"),
    ));

    // General Equipment
    obj.put(DataElement::new(
        tags::CONVERSION_TYPE,
        VR::CS,
        PrimitiveValue::from("SD"),
    ));
    put_string_or_empty(
        &mut obj,
        tags::MANUFACTURER,
        VR::LO,
        &options.equipment.manufacturer,
    );

    if options.kind == DocumentKind::Stl {
        put_stl_modules(&mut obj, options)?;
    }

    // Encapsulated Document
    obj.put(DataElement::new(
        tags::INSTANCE_NUMBER,
        VR::IS,
        PrimitiveValue::from(ids.instance_number.to_string()),
    ));
    obj.put(DataElement::new(
        tags::CONTENT_DATE,
        VR::DA,
        PrimitiveValue::Empty,
    ));
    obj.put(DataElement::new(
        tags::CONTENT_TIME,
        VR::TM,
        PrimitiveValue::Empty,
    ));
    obj.put(DataElement::new(
        tags::ACQUISITION_DATE_TIME,
        VR::DT,
        PrimitiveValue::Empty,
    ));
    obj.put(DataElement::new(
        tags::BURNED_IN_ANNOTATION,
        VR::CS,
        PrimitiveValue::from(if options.burned_in_annotation {
            "YES"
        } else {
            "NO"
        }),
    ));
    put_string_or_empty(
        &mut obj,
        tags::DOCUMENT_TITLE,
        VR::ST,
        &options.document_title,
    );
    match &options.concept_name {
        Some(concept) => {
            let item = InMemDicomObject::from_element_iter(vec![
                DataElement::new(
                    tags::CODE_VALUE,
                    VR::SH,
                    PrimitiveValue::from(concept.code_value.as_str()),
                ),
                DataElement::new(
                    tags::CODING_SCHEME_DESIGNATOR,
                    VR::SH,
                    PrimitiveValue::from(concept.coding_scheme.as_str()),
                ),
                DataElement::new(
                    tags::CODE_MEANING,
                    VR::LO,
                    PrimitiveValue::from(concept.code_meaning.as_str()),
                ),
            ]);
            obj.put(DataElement::new(
                tags::CONCEPT_NAME_CODE_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![item]),
            ));
        }
        None => {
            obj.put(DataElement::new(
                tags::CONCEPT_NAME_CODE_SEQUENCE,
                VR::SQ,
                DataSetSequence::empty(),
            ));
        }
    }
    obj.put(DataElement::new(
        tags::MIME_TYPE_OF_ENCAPSULATED_DOCUMENT,
        VR::LO,
        PrimitiveValue::from(mime_type),
    ));

    let mut data = payload.into_data();
    if data.len() % 2 != 0 {
        data.push(0);
    }
    obj.put(DataElement::new(
        tags::ENCAPSULATED_DOCUMENT,
        VR::OB,
        PrimitiveValue::from(data),
    ));

    Ok(obj)
}

/// Frame of Reference, measurement units
/// and Enhanced General Equipment for STL objects,
/// where the equipment attributes are type 1.
fn put_stl_modules(obj: &mut InMemDicomObject, options: &EncapOptions) -> Result<()> {
    let equipment = &options.equipment;
    let manufacturer = equipment
        .manufacturer
        .as_deref()
        .context(MissingEquipmentSnafu {
            name: "Manufacturer",
        })?;
    let model_name = equipment
        .manufacturer_model_name
        .as_deref()
        .context(MissingEquipmentSnafu {
            name: "ManufacturerModelName",
        })?;
    let serial_number = equipment
        .device_serial_number
        .as_deref()
        .context(MissingEquipmentSnafu {
            name: "DeviceSerialNumber",
        })?;
    let software_versions =
        equipment
            .software_versions
            .as_deref()
            .context(MissingEquipmentSnafu {
                name: "SoftwareVersions",
            })?;

    obj.put(DataElement::new(
        tags::MANUFACTURER,
        VR::LO,
        PrimitiveValue::from(manufacturer),
    ));
    obj.put(DataElement::new(
        tags::MANUFACTURER_MODEL_NAME,
        VR::LO,
        PrimitiveValue::from(model_name),
    ));
    obj.put(DataElement::new(
        tags::DEVICE_SERIAL_NUMBER,
        VR::LO,
        PrimitiveValue::from(serial_number),
    ));
    obj.put(DataElement::new(
        tags::SOFTWARE_VERSIONS,
        VR::LO,
        PrimitiveValue::from(software_versions),
    ));

    obj.put(DataElement::new(
        tags::FRAME_OF_REFERENCE_UID,
        VR::UI,
        PrimitiveValue::from(new_uid()),
    ));
    obj.put(DataElement::new(
        tags::POSITION_REFERENCE_INDICATOR,
        VR::LO,
        PrimitiveValue::Empty,
    ));

    let units = InMemDicomObject::from_element_iter(vec![
        DataElement::new(tags::CODE_VALUE, VR::SH, PrimitiveValue::from("mm")),
        DataElement::new(
            tags::CODING_SCHEME_DESIGNATOR,
            VR::SH,
            PrimitiveValue::from("UCUM"),
        ),
        DataElement::new(tags::CODE_MEANING, VR::LO, PrimitiveValue::from("mm")),
    ]);
    obj.put(DataElement::new(
        tags::MEASUREMENT_UNITS_CODE_SEQUENCE,
        VR::SQ,
        DataSetSequence::from(vec![units]),
    ));

    Ok(())
}

fn put_string_or_empty(
    obj: &mut InMemDicomObject,
    tag: dicom_core::Tag,
    vr: VR,
    value: &Option<String>,
) {
    match value {
        Some(v) => obj.put(DataElement::new(tag, vr, PrimitiveValue::from(v.as_str()))),
        None => obj.put(DataElement::new(tag, vr, PrimitiveValue::Empty)),
    };
}

fn check_len(name: &'static str, value: &str, max: usize) -> Result<()> {
    ensure!(
        value.chars().count() <= max,
        ValueTooLongSnafu {
            name,
            len: value.chars().count(),
            max,
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::IdentifierSet;

    fn pdf_identifiers() -> IdentifierSet {
        IdentifierSet::generate(DocumentKind::Pdf.sop_class_uid(), None).unwrap()
    }

    #[test]
    fn five_byte_payload_gets_one_pad_byte() {
        let ids = pdf_identifiers();
        let payload = DocumentPayload::new(vec![0x25, 0x50, 0x44, 0x46, 0x2D], None);
        let obj = encapsulate(
            &ids,
            payload,
            &PatientData::default(),
            &EncapOptions::default(),
        )
        .unwrap();

        let doc = obj.element(tags::ENCAPSULATED_DOCUMENT).unwrap();
        let bytes = doc.value().to_bytes().unwrap();
        assert_eq!(&*bytes, &[0x25, 0x50, 0x44, 0x46, 0x2D, 0x00]);

        let sop_uid = obj.element(tags::SOP_INSTANCE_UID).unwrap();
        assert!(!sop_uid.value().to_str().unwrap().is_empty());
        let number = obj.element(tags::INSTANCE_NUMBER).unwrap();
        assert_eq!(number.value().to_int::<u32>().unwrap(), 1);
    }

    #[test]
    fn even_payload_is_untouched() {
        let ids = pdf_identifiers();
        let payload = DocumentPayload::new(vec![1, 2, 3, 4], None);
        let obj = encapsulate(
            &ids,
            payload,
            &PatientData::default(),
            &EncapOptions::default(),
        )
        .unwrap();
        let bytes = obj
            .element(tags::ENCAPSULATED_DOCUMENT)
            .unwrap()
            .value()
            .to_bytes()
            .unwrap();
        assert_eq!(&*bytes, &[1, 2, 3, 4]);
    }

    #[test]
    fn mime_type_priority_is_explicit_then_hint_then_default() {
        let ids = pdf_identifiers();

        let payload = DocumentPayload::new(vec![0, 0], Some("text/plain".to_string()));
        let mut options = EncapOptions::default();
        options.mime_type = Some("application/octet-stream".to_string());
        let obj = encapsulate(&ids, payload, &PatientData::default(), &options).unwrap();
        assert_eq!(
            obj.element(tags::MIME_TYPE_OF_ENCAPSULATED_DOCUMENT)
                .unwrap()
                .value()
                .to_str()
                .unwrap(),
            "application/octet-stream"
        );

        let payload = DocumentPayload::new(vec![0, 0], Some("text/plain".to_string()));
        let obj = encapsulate(
            &ids,
            payload,
            &PatientData::default(),
            &EncapOptions::default(),
        )
        .unwrap();
        assert_eq!(
            obj.element(tags::MIME_TYPE_OF_ENCAPSULATED_DOCUMENT)
                .unwrap()
                .value()
                .to_str()
                .unwrap(),
            "text/plain"
        );

        let payload = DocumentPayload::new(vec![0, 0], None);
        let obj = encapsulate(
            &ids,
            payload,
            &PatientData::default(),
            &EncapOptions::default(),
        )
        .unwrap();
        assert_eq!(
            obj.element(tags::MIME_TYPE_OF_ENCAPSULATED_DOCUMENT)
                .unwrap()
                .value()
                .to_str()
                .unwrap(),
            "application/pdf"
        );
    }

    #[test]
    fn patient_data_takes_precedence_over_defaults() {
        let ids = pdf_identifiers();
        let patient = PatientData {
            name: Some("Doe^John".to_string()),
            id: Some("PAT-1".to_string()),
            ..PatientData::default()
        };
        let obj = encapsulate(
            &ids,
            DocumentPayload::new(vec![0, 0], None),
            &patient,
            &EncapOptions::default(),
        )
        .unwrap();
        assert_eq!(
            obj.element(tags::PATIENT_NAME)
                .unwrap()
                .value()
                .to_str()
                .unwrap(),
            "Doe^John"
        );
        // absent patient attributes become empty type 2 elements
        assert!(obj
            .element(tags::PATIENT_SEX)
            .unwrap()
            .value()
            .to_str()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn cda_objects_use_the_cda_sop_class() {
        let ids = IdentifierSet::generate(DocumentKind::Cda.sop_class_uid(), None).unwrap();
        let obj = encapsulate(
            &ids,
            DocumentPayload::new(vec![b'<', b'x'], None),
            &PatientData::default(),
            &EncapOptions::new(DocumentKind::Cda),
        )
        .unwrap();
        assert_eq!(
            obj.element(tags::SOP_CLASS_UID)
                .unwrap()
                .value()
                .to_str()
                .unwrap(),
            uids::ENCAPSULATED_CDA_STORAGE
        );
        assert_eq!(
            obj.element(tags::MODALITY)
                .unwrap()
                .value()
                .to_str()
                .unwrap(),
            "DOC"
        );
    }

    #[test]
    fn stl_requires_equipment_info() {
        let ids = IdentifierSet::generate(DocumentKind::Stl.sop_class_uid(), None).unwrap();
        let err = encapsulate(
            &ids,
            DocumentPayload::new(vec![0, 0], None),
            &PatientData::default(),
            &EncapOptions::new(DocumentKind::Stl),
        )
        .expect_err("STL without equipment info must fail");
        assert!(matches!(err, CompositionError::MissingEquipment { .. }));
    }

    #[test]
    fn stl_with_equipment_gets_frame_of_reference() {
        let ids = IdentifierSet::generate(DocumentKind::Stl.sop_class_uid(), None).unwrap();
        let mut options = EncapOptions::new(DocumentKind::Stl);
        options.equipment = EquipmentInfo {
            manufacturer: Some("ACME".to_string()),
            manufacturer_model_name: Some("Modeler".to_string()),
            device_serial_number: Some("0001".to_string()),
            software_versions: Some("1.0".to_string()),
        };
        let obj = encapsulate(
            &ids,
            DocumentPayload::new(vec![0, 0], None),
            &PatientData::default(),
            &options,
        )
        .unwrap();
        assert!(!obj
            .element(tags::FRAME_OF_REFERENCE_UID)
            .unwrap()
            .value()
            .to_str()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn oversized_code_value_is_rejected() {
        let ids = pdf_identifiers();
        let mut options = EncapOptions::default();
        options.concept_name = Some(CodedEntry {
            code_value: "X".repeat(17),
            coding_scheme: "DCM".to_string(),
            code_meaning: "whatever".to_string(),
        });
        let err = encapsulate(
            &ids,
            DocumentPayload::new(vec![0, 0], None),
            &PatientData::default(),
            &options,
        )
        .expect_err("oversized code value must fail");
        assert!(matches!(err, CompositionError::ValueTooLong { .. }));
    }
}
