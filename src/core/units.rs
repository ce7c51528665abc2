//! Flux conversion factors between instrumental units (pW) and calibrated
//! flux units.

use crate::types::{PipelineError, PipelineResult, Waveband};

/// Standard FCF converting pW into `units` for the given band
pub fn standard_fcf(units: &str, band: Waveband) -> Option<f64> {
    let (f450, f850) = match units.trim() {
        "mJy/beam" => (491_000.0, 537_000.0),
        "Jy/beam" => (491.0, 537.0),
        "mJy/arcsec**2" | "mJy/arcsec^2" => (4_710.0, 2_340.0),
        "Jy/arcsec**2" | "Jy/arcsec^2" => (4.71, 2.34),
        _ => return None,
    };
    Some(match band {
        Waveband::Band450 => f450,
        Waveband::Band850 => f850,
    })
}

/// Jy/beam per pW used when scaling the vector catalogue
pub fn catalogue_fcf(band: Waveband) -> f64 {
    match band {
        Waveband::Band450 => 962.0,
        Waveband::Band850 => 725.0,
    }
}

/// How a reference map has to be scaled to be in pW
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConversion {
    /// Divide the reference by this
    pub fcf: f64,
    pub source: FcfSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcfSource {
    User,
    Header,
    Standard,
}

/// Work out the FCF needed to bring a reference map in `units` back to pW.
///
/// `None` means the map is already in pW. A header FCF is preferred to the
/// standard value but is suspicious when it differs from it by more than a
/// factor of two; that case is returned as a warning.
pub fn reference_conversion(
    units: &str,
    band: Waveband,
    header_fcf: Option<f64>,
    user_fcf: Option<f64>,
) -> PipelineResult<Option<(UnitConversion, Option<String>)>> {
    if units.trim() == "pW" {
        return Ok(None);
    }
    if let Some(fcf) = user_fcf {
        return Ok(Some((
            UnitConversion {
                fcf,
                source: FcfSource::User,
            },
            None,
        )));
    }

    let standard = standard_fcf(units, band);
    match (header_fcf, standard) {
        (Some(header), Some(standard)) => {
            let ratio = header / standard;
            let warning = (!(0.5..=2.0).contains(&ratio)).then(|| {
                format!(
                    "Reference map FCF {} differs from the standard {} {} FCF {} by {:.2}x",
                    header,
                    band.microns(),
                    units,
                    standard,
                    ratio
                )
            });
            Ok(Some((
                UnitConversion {
                    fcf: header,
                    source: FcfSource::Header,
                },
                warning,
            )))
        }
        (Some(header), None) => Ok(Some((
            UnitConversion {
                fcf: header,
                source: FcfSource::Header,
            },
            None,
        ))),
        (None, Some(standard)) => Ok(Some((
            UnitConversion {
                fcf: standard,
                source: FcfSource::Standard,
            },
            None,
        ))),
        (None, None) => Err(PipelineError::InvalidConfiguration(format!(
            "Reference map has unsupported units '{}'",
            units
        ))),
    }
}
