//! Application of caller-supplied attribute overrides
//! onto a composed data set.
//!
//! Override directives use the syntax `«tag»=«value»`,
//! where `«tag»` is either a DICOM tag group-element pair
//! (such as `(0010,0010)` or `0010,0010`)
//! or the attribute keyword (such as `PatientName`),
//! and the value is interpreted
//! according to the value representation of the resolved tag.
//!
//! Directives are applied in the caller's order,
//! replacing existing elements and inserting missing ones.
//! The first directive that cannot be applied
//! aborts the whole batch,
//! so that a partially overridden data set is never persisted.
use std::str::FromStr;

use dicom_core::{DataDictionary, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::InMemDicomObject;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::warn;

#[derive(Debug, Snafu)]
pub enum OverrideError {
    /// The directive has no attribute tag or keyword.
    #[snafu(display("Override directive `{}` has no attribute", directive))]
    MissingTag { directive: String },

    /// The attribute could not be resolved to a tag,
    /// neither as a group-element pair nor as a dictionary keyword.
    #[snafu(display("Could not resolve attribute `{}`", name))]
    ResolveTag { name: String },

    /// The value is not a valid integer for the target attribute.
    #[snafu(display("Invalid integer `{}` for {}: {}", value, tag, source))]
    InvalidInteger {
        tag: Tag,
        value: String,
        source: std::num::ParseIntError,
    },

    /// The value is not a valid floating point number for the target attribute.
    #[snafu(display("Invalid number `{}` for {}: {}", value, tag, source))]
    InvalidNumber {
        tag: Tag,
        value: String,
        source: std::num::ParseFloatError,
    },

    /// The value representation of the target attribute
    /// cannot be overridden from a text directive.
    #[snafu(display("Cannot override {} with value representation {:?}", tag, vr))]
    UnsupportedVr { tag: Tag, vr: VR },
}

type Result<T, E = OverrideError> = std::result::Result<T, E>;

/// A single override directive: force `tag` to hold `value`.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct OverrideKey {
    pub tag: Tag,
    pub value: String,
}

impl OverrideKey {
    pub fn new(tag: Tag, value: impl Into<String>) -> Self {
        OverrideKey {
            tag,
            value: value.into(),
        }
    }
}

/// Override directives are parsed with the syntax `«tag»=«value»`;
/// a missing `=«value»` part yields an empty value.
impl FromStr for OverrideKey {
    type Err = OverrideError;

    fn from_str(s: &str) -> Result<Self> {
        let (tag_part, value_part) = match s.split_once('=') {
            Some((tag_part, value_part)) => (tag_part.trim(), value_part),
            None => (s.trim(), ""),
        };
        snafu::ensure!(!tag_part.is_empty(), MissingTagSnafu { directive: s });

        let tag: Tag = tag_part.parse().ok().or_else(|| {
            // look for the keyword in the standard data dictionary
            StandardDataDictionary
                .by_name(tag_part)
                .map(|entry| entry.tag.inner())
        })
        .context(ResolveTagSnafu { name: tag_part })?;

        Ok(OverrideKey {
            tag,
            value: value_part.to_owned(),
        })
    }
}

/// Apply the given directives onto the data set, in order.
///
/// Later directives for the same tag overwrite earlier ones.
/// Fails fast on the first directive that cannot be applied,
/// leaving the data set in an unspecified state
/// which must not be persisted.
pub fn apply_overrides(obj: &mut InMemDicomObject, keys: &[OverrideKey]) -> Result<()> {
    for key in keys {
        obj.put(element_for(key.tag, &key.value)?);
    }
    Ok(())
}

/// Build a data element for the tag,
/// coercing the text value into the value representation
/// registered for it in the data dictionary.
fn element_for<I, P>(tag: Tag, txt_value: &str) -> Result<DataElement<I, P>>
where
    I: dicom_core::header::HasLength,
{
    let vr = StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.vr.relaxed())
        .unwrap_or_else(|| {
            warn!("attribute {} not in the data dictionary, assuming LO", tag);
            VR::LO
        });
    let value = match vr {
        VR::AE
        | VR::AS
        | VR::CS
        | VR::DA
        | VR::DS
        | VR::IS
        | VR::LO
        | VR::LT
        | VR::SH
        | VR::PN
        | VR::ST
        | VR::TM
        | VR::UI
        | VR::UC
        | VR::UR
        | VR::UT
        | VR::DT => PrimitiveValue::from(txt_value),
        VR::SS => {
            let ss: i16 = txt_value
                .parse()
                .context(InvalidIntegerSnafu { tag, value: txt_value })?;
            PrimitiveValue::from(ss)
        }
        VR::SL => {
            let sl: i32 = txt_value
                .parse()
                .context(InvalidIntegerSnafu { tag, value: txt_value })?;
            PrimitiveValue::from(sl)
        }
        VR::SV => {
            let sv: i64 = txt_value
                .parse()
                .context(InvalidIntegerSnafu { tag, value: txt_value })?;
            PrimitiveValue::from(sv)
        }
        VR::US => {
            let us: u16 = txt_value
                .parse()
                .context(InvalidIntegerSnafu { tag, value: txt_value })?;
            PrimitiveValue::from(us)
        }
        VR::UL => {
            let ul: u32 = txt_value
                .parse()
                .context(InvalidIntegerSnafu { tag, value: txt_value })?;
            PrimitiveValue::from(ul)
        }
        VR::UV => {
            let uv: u64 = txt_value
                .parse()
                .context(InvalidIntegerSnafu { tag, value: txt_value })?;
            PrimitiveValue::from(uv)
        }
        VR::FL => {
            let fl: f32 = txt_value
                .parse()
                .context(InvalidNumberSnafu { tag, value: txt_value })?;
            PrimitiveValue::from(fl)
        }
        VR::FD => {
            let fd: f64 = txt_value
                .parse()
                .context(InvalidNumberSnafu { tag, value: txt_value })?;
            PrimitiveValue::from(fd)
        }
        vr => return UnsupportedVrSnafu { tag, vr }.fail(),
    };
    Ok(DataElement::new(tag, vr, value))
}
