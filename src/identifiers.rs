//! Generation of the unique identifiers
//! which bind an encapsulated document object to its clinical context.
//!
//! A fresh [`IdentifierSet`] can be generated from scratch,
//! or derived from a [`SeriesContext`]
//! so that the new instance extends an existing series
//! with the next free instance number.
use std::path::Path;

use dicom_dictionary_std::tags;
use dicom_object::{open_file, InMemDicomObject};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum IdentifierError {
    /// The DICOM file providing the series context could not be read.
    #[snafu(display("Could not read series source file {}: {}", path.display(), source))]
    ReadSeriesSource {
        path: std::path::PathBuf,
        source: dicom_object::ReadError,
    },

    /// The series context source is missing a required attribute.
    #[snafu(display("Missing attribute {} in series context", name))]
    MissingAttribute { name: &'static str },

    /// A UID in the series context is empty.
    #[snafu(display("Series context has an empty {}", name))]
    EmptyUid { name: &'static str },

    /// The instance number in the series context is not a number.
    #[snafu(display("Instance number `{}` in series context is not numeric", value))]
    NonNumericInstanceNumber { value: String },

    /// The instance number space of the series is exhausted.
    #[snafu(display("No instance number left after {}", prior_max))]
    InstanceNumberExhausted { prior_max: u32 },
}

type Result<T, E = IdentifierError> = std::result::Result<T, E>;

/// Generate a new DICOM unique identifier
/// rooted under the UUID-derived `2.25` prefix,
/// as described in PS3.5 B.2.
pub fn new_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// The position in an existing series
/// which a new encapsulated document instance should extend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesContext {
    /// Study Instance UID to reuse,
    /// or `None` to generate a fresh one
    pub study_instance_uid: Option<String>,
    /// Series Instance UID to reuse
    pub series_instance_uid: String,
    /// the highest instance number already used in the series
    pub prior_max: u32,
}

impl SeriesContext {
    /// Create a series context from its bare parts.
    pub fn from_parts(series_instance_uid: impl Into<String>, prior_max: u32) -> Self {
        SeriesContext {
            study_instance_uid: None,
            series_instance_uid: series_instance_uid.into(),
            prior_max,
        }
    }

    /// Extract a series context from a data set
    /// of an instance already part of the target series.
    pub fn from_object<D>(obj: &InMemDicomObject<D>) -> Result<Self>
    where
        D: dicom_core::dictionary::DataDictionary + Clone,
    {
        let series_instance_uid = obj
            .element(tags::SERIES_INSTANCE_UID)
            .ok()
            .map(|e| e.value().to_str().unwrap_or_default().to_string())
            .context(MissingAttributeSnafu {
                name: "SeriesInstanceUID",
            })?;
        let study_instance_uid = obj
            .element(tags::STUDY_INSTANCE_UID)
            .ok()
            .map(|e| e.value().to_str().unwrap_or_default().to_string());

        // missing instance number starts counting at 1
        let prior_max = match obj.element(tags::INSTANCE_NUMBER).ok() {
            Some(e) => {
                let value = e.value().to_str().unwrap_or_default().to_string();
                e.value()
                    .to_int::<u32>()
                    .ok()
                    .context(NonNumericInstanceNumberSnafu { value })?
            }
            None => {
                tracing::warn!("series context has no instance number, assuming 0");
                0
            }
        };

        Ok(SeriesContext {
            study_instance_uid: study_instance_uid.map(trimmed),
            series_instance_uid: trimmed(series_instance_uid),
            prior_max,
        })
    }

    /// Read a series context from a DICOM file of the target series.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let obj = open_file(path).context(ReadSeriesSourceSnafu { path })?;
        Self::from_object(&obj)
    }
}

/// The full set of identifiers of a single encapsulated document instance.
///
/// Once generated, the set is immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierSet {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub instance_number: u32,
}

impl IdentifierSet {
    /// Generate the identifiers for a new instance of the given SOP class.
    ///
    /// Without a series context,
    /// fresh study and series UIDs are generated
    /// and the instance number is 1.
    /// With a context,
    /// the study and series UIDs are reused
    /// and the instance number is the successor of the context's maximum.
    /// The SOP instance UID is always freshly generated.
    pub fn generate(
        sop_class_uid: impl Into<String>,
        context: Option<&SeriesContext>,
    ) -> Result<Self> {
        let sop_instance_uid = new_uid();
        match context {
            None => Ok(IdentifierSet {
                study_instance_uid: new_uid(),
                series_instance_uid: new_uid(),
                sop_instance_uid,
                sop_class_uid: sop_class_uid.into(),
                instance_number: 1,
            }),
            Some(ctx) => {
                ensure!(
                    !ctx.series_instance_uid.trim().is_empty(),
                    EmptyUidSnafu {
                        name: "SeriesInstanceUID",
                    }
                );
                if let Some(study) = &ctx.study_instance_uid {
                    ensure!(
                        !study.trim().is_empty(),
                        EmptyUidSnafu {
                            name: "StudyInstanceUID",
                        }
                    );
                }
                let instance_number = ctx.prior_max.checked_add(1).context(
                    InstanceNumberExhaustedSnafu {
                        prior_max: ctx.prior_max,
                    },
                )?;
                Ok(IdentifierSet {
                    study_instance_uid: ctx
                        .study_instance_uid
                        .clone()
                        .unwrap_or_else(new_uid),
                    series_instance_uid: ctx.series_instance_uid.clone(),
                    sop_instance_uid,
                    sop_class_uid: sop_class_uid.into(),
                    instance_number,
                })
            }
        }
    }
}

/// Strip the trailing padding which UI and string values
/// may carry after a round trip through a file.
fn trimmed(value: String) -> String {
    value.trim_end_matches(['\0', ' ']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::uids;

    #[test]
    fn fresh_identifiers_are_complete() {
        let ids = IdentifierSet::generate(uids::ENCAPSULATED_PDF_STORAGE, None).unwrap();
        assert!(!ids.study_instance_uid.is_empty());
        assert!(!ids.series_instance_uid.is_empty());
        assert!(ids.sop_instance_uid.starts_with("2.25."));
        assert_eq!(ids.instance_number, 1);
    }

    #[test]
    fn sop_instance_uids_never_collide() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1_000 {
            let ids = IdentifierSet::generate(uids::ENCAPSULATED_PDF_STORAGE, None).unwrap();
            assert!(seen.insert(ids.sop_instance_uid.clone()), "duplicate UID");
        }
    }

    #[test]
    fn uids_fit_in_ui_value_representation() {
        for _ in 0..100 {
            assert!(new_uid().len() <= 64);
        }
    }

    #[test]
    fn series_context_is_monotonic() {
        let ctx = SeriesContext::from_parts("1.2.3", 4);
        let ids = IdentifierSet::generate(uids::ENCAPSULATED_PDF_STORAGE, Some(&ctx)).unwrap();
        assert_eq!(ids.instance_number, 5);
        assert_eq!(ids.series_instance_uid, "1.2.3");
    }

    #[test]
    fn series_context_reuses_study_uid() {
        let ctx = SeriesContext {
            study_instance_uid: Some("1.2".to_string()),
            series_instance_uid: "1.2.3".to_string(),
            prior_max: 0,
        };
        let ids = IdentifierSet::generate(uids::ENCAPSULATED_PDF_STORAGE, Some(&ctx)).unwrap();
        assert_eq!(ids.study_instance_uid, "1.2");
        assert_eq!(ids.instance_number, 1);
    }

    #[test]
    fn empty_series_uid_is_rejected() {
        let ctx = SeriesContext::from_parts("  ", 1);
        let err = IdentifierSet::generate(uids::ENCAPSULATED_PDF_STORAGE, Some(&ctx))
            .expect_err("empty UID must be rejected");
        assert!(matches!(err, IdentifierError::EmptyUid { .. }));
    }

    #[test]
    fn unreadable_series_source_is_reported() {
        let err = SeriesContext::from_file("/definitely/not/here.dcm")
            .expect_err("missing file must be reported");
        assert!(matches!(err, IdentifierError::ReadSeriesSource { .. }));
    }
}
