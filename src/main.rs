//! A CLI tool for encapsulating a document file
//! (PDF, CDA, or STL)
//! into a DICOM encapsulated document file.
use std::path::PathBuf;

use clap::Parser;
use dicom_encapdoc::{
    apply_overrides, encapsulate, finalize, load_document, CodedEntry, DocumentKind, EncapOptions,
    EquipmentInfo, IdentifierSet, OverrideKey, PatientData, SeriesContext, TransferSyntaxChoice,
};
use dicom_object::open_file;
use snafu::Report;
use tracing::{error, info, Level};

/// Exit code for when the source document or series file could not be read.
const ERROR_LOAD: i32 = -1;
/// Exit code for when the instance identifiers could not be generated.
const ERROR_IDENTIFIERS: i32 = -2;
/// Exit code for when the data set could not be composed.
const ERROR_COMPOSE: i32 = -3;
/// Exit code for when an override directive could not be applied.
const ERROR_OVERRIDE: i32 = -4;
/// Exit code for when the output file could not be written.
const ERROR_WRITE: i32 = -5;

/// Encapsulate a document into a DICOM file
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// Path to the source document (PDF, CDA, or STL)
    document: PathBuf,
    /// Path to the DICOM file to create
    output: PathBuf,

    /// The kind of document to encapsulate
    /// (default is to guess from the file extension, falling back to pdf)
    #[arg(short = 't', long = "document-type", value_enum)]
    document_type: Option<DocumentKind>,

    /// Patient's full name
    #[arg(long = "patient-name")]
    patient_name: Option<String>,
    /// Patient ID
    #[arg(long = "patient-id")]
    patient_id: Option<String>,
    /// Patient's birth date (YYYYMMDD)
    #[arg(long = "patient-birthdate")]
    patient_birthdate: Option<String>,
    /// Patient's sex (M, F, or O)
    #[arg(long = "patient-sex")]
    patient_sex: Option<String>,

    /// Document title
    #[arg(long = "title")]
    title: Option<String>,
    /// Concept name code (code value, coding scheme designator, code meaning)
    #[arg(long = "concept-name", num_args = 3, value_names = ["CODE", "SCHEME", "MEANING"])]
    concept_name: Option<Vec<String>>,
    /// MIME type of the document
    /// (default is to guess from the file extension)
    #[arg(long = "mime-type")]
    mime_type: Option<String>,
    /// Declare that the document contains no burned-in annotations
    #[arg(long = "no-annotation")]
    no_annotation: bool,

    /// Manufacturer of the equipment (mandatory for STL)
    #[arg(long = "manufacturer")]
    manufacturer: Option<String>,
    /// Manufacturer's model name (mandatory for STL)
    #[arg(long = "manufacturer-model")]
    manufacturer_model: Option<String>,
    /// Device serial number (mandatory for STL)
    #[arg(long = "serial-number")]
    serial_number: Option<String>,
    /// Software versions (mandatory for STL)
    #[arg(long = "software-versions")]
    software_versions: Option<String>,

    /// Extend the series of an existing DICOM file,
    /// reusing its study, series, and patient attributes
    #[arg(long = "series-from")]
    series_from: Option<PathBuf>,

    /// Override an attribute in the final data set
    /// (format: «tag»=«value», e.g. "PatientComments=report"),
    /// may be used multiple times
    #[arg(short = 'k', long = "key")]
    keys: Vec<OverrideKey>,

    /// Output transfer syntax
    #[arg(
        short = 'x',
        long = "transfer-syntax",
        value_enum,
        default_value_t = TransferSyntaxChoice::default()
    )]
    transfer_syntax: TransferSyntaxChoice,

    /// Print more information about the pipeline run
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let App {
        document,
        output,
        document_type,
        patient_name,
        patient_id,
        patient_birthdate,
        patient_sex,
        title,
        concept_name,
        mime_type,
        no_annotation,
        manufacturer,
        manufacturer_model,
        serial_number,
        software_versions,
        series_from,
        keys,
        transfer_syntax,
        verbose,
    } = App::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
            .finish(),
    )
    .unwrap_or_else(|e| {
        eprintln!(
            "Could not set up global logging subscriber: {}",
            Report::from_error(e)
        );
    });

    let kind = document_type
        .or_else(|| DocumentKind::from_extension(&document))
        .unwrap_or_default();

    // the series file also provides fallback patient attributes
    let (series_context, series_patient) = match series_from {
        Some(path) => {
            let series_obj = open_file(&path).unwrap_or_else(|e| {
                error!("{}", Report::from_error(e));
                std::process::exit(ERROR_LOAD);
            });
            let context = SeriesContext::from_object(&series_obj).unwrap_or_else(|e| {
                error!("{}", Report::from_error(e));
                std::process::exit(ERROR_IDENTIFIERS);
            });
            (Some(context), PatientData::from_object(&series_obj))
        }
        None => (None, PatientData::default()),
    };

    let patient = PatientData {
        name: patient_name,
        id: patient_id,
        birth_date: patient_birthdate,
        sex: patient_sex,
    }
    .or(series_patient);

    let options = EncapOptions {
        kind,
        document_title: title,
        concept_name: concept_name.map(|parts| CodedEntry {
            code_value: parts[0].clone(),
            coding_scheme: parts[1].clone(),
            code_meaning: parts[2].clone(),
        }),
        mime_type,
        burned_in_annotation: !no_annotation,
        equipment: EquipmentInfo {
            manufacturer,
            manufacturer_model_name: manufacturer_model,
            device_serial_number: serial_number,
            software_versions,
        },
    };

    let ids =
        IdentifierSet::generate(kind.sop_class_uid(), series_context.as_ref()).unwrap_or_else(
            |e| {
                error!("{}", Report::from_error(e));
                std::process::exit(ERROR_IDENTIFIERS);
            },
        );
    if verbose {
        info!("SOP instance UID: {}", ids.sop_instance_uid);
        info!("instance number: {}", ids.instance_number);
    }

    let payload = load_document(&document).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(ERROR_LOAD);
    });
    info!("creating encapsulated {:?} object", kind);

    let mut obj = encapsulate(&ids, payload, &patient, &options).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(ERROR_COMPOSE);
    });

    apply_overrides(&mut obj, &keys).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(ERROR_OVERRIDE);
    });

    info!(
        "writing encapsulated document object to {}",
        output.display()
    );
    let result = finalize(&obj, transfer_syntax, &output).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(ERROR_WRITE);
    });

    if verbose {
        info!(
            "encapsulation successful ({} bytes written)",
            result.bytes_written
        );
    }
}
