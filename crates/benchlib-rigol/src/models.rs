//! Rigol DS model definitions.
//!
//! Each supported oscilloscope is described by a [`RigolModel`] that points
//! at the [`Series`] it belongs to. The series carries everything the
//! acquisition state machine needs to know: which command generation
//! ([`Protocol`]) the firmware speaks, how waveform bytes are encoded
//! ([`DataFormat`]), and how many samples a live screen or the deep memory
//! holds.
//!
//! | Series  | Protocol | Format | Divs | Live | Memory   |
//! |---------|----------|--------|------|------|----------|
//! | VS5000  | V1       | legacy | 14   | 2048 | --       |
//! | DS1000  | V2       | IEEE   | 12   | 600  | 1048576  |
//! | DS2000  | V3       | IEEE   | 14   | 1400 | 14000    |
//! | DS2000A | V3       | IEEE   | 14   | 1400 | 14000    |
//! | DSO1000 | V3       | IEEE   | 12   | 600  | 20480    |
//! | DS1000Z | V4       | IEEE   | 12   | 1200 | 12000000 |
//! | DS4000  | V4       | IEEE   | 14   | 1400 | queried  |
//!
//! DS1000 firmware older than 0.2.4 still sends the legacy format, see
//! [`firmware_uses_legacy_format`].

use std::fmt;

/// Command generation spoken by a series' firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    V1,
    V2,
    V3,
    V4,
}

/// Encoding of waveform bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// Unframed bytes, `128` at the top of the screen going down.
    Legacy,
    /// IEEE-488.2 definite-length blocks relative to a vertical reference.
    Ieee4882,
}

/// Instrument vendor as reported in the first `*IDN?` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Rigol,
    Agilent,
}

impl Vendor {
    /// Short vendor name.
    pub fn name(self) -> &'static str {
        match self {
            Vendor::Rigol => "Rigol",
            Vendor::Agilent => "Agilent",
        }
    }

    /// Manufacturer string as it appears in `*IDN?`.
    pub fn full_name(self) -> &'static str {
        match self {
            Vendor::Rigol => "Rigol Technologies",
            Vendor::Agilent => "Agilent Technologies",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static description of one instrument series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Series {
    pub vendor: Vendor,
    pub name: &'static str,
    pub protocol: Protocol,
    pub format: DataFormat,
    /// Horizontal divisions on screen.
    pub num_horizontal_divs: u32,
    /// Samples per channel in a live (screen) capture.
    pub live_samples: usize,
    /// Deep memory size in samples. Zero means the depth is configurable
    /// and must be queried from the instrument.
    pub buffer_samples: usize,
}

pub const VS5000: Series = Series {
    vendor: Vendor::Rigol,
    name: "VS5000",
    protocol: Protocol::V1,
    format: DataFormat::Legacy,
    num_horizontal_divs: 14,
    live_samples: 2048,
    buffer_samples: 0,
};

pub const DS1000: Series = Series {
    vendor: Vendor::Rigol,
    name: "DS1000",
    protocol: Protocol::V2,
    format: DataFormat::Ieee4882,
    num_horizontal_divs: 12,
    live_samples: 600,
    buffer_samples: 1_048_576,
};

pub const DS2000: Series = Series {
    vendor: Vendor::Rigol,
    name: "DS2000",
    protocol: Protocol::V3,
    format: DataFormat::Ieee4882,
    num_horizontal_divs: 14,
    live_samples: 1400,
    buffer_samples: 14_000,
};

pub const DS2000A: Series = Series {
    name: "DS2000A",
    ..DS2000
};

pub const DSO1000: Series = Series {
    vendor: Vendor::Agilent,
    name: "DSO1000",
    protocol: Protocol::V3,
    format: DataFormat::Ieee4882,
    num_horizontal_divs: 12,
    live_samples: 600,
    buffer_samples: 20_480,
};

pub const DS1000Z: Series = Series {
    vendor: Vendor::Rigol,
    name: "DS1000Z",
    protocol: Protocol::V4,
    format: DataFormat::Ieee4882,
    num_horizontal_divs: 12,
    live_samples: 1200,
    buffer_samples: 12_000_000,
};

pub const DS4000: Series = Series {
    vendor: Vendor::Rigol,
    name: "DS4000",
    protocol: Protocol::V4,
    format: DataFormat::Ieee4882,
    num_horizontal_divs: 14,
    live_samples: 1400,
    buffer_samples: 0,
};

/// Number of logic-analyzer channels on mixed-signal models.
pub const NUM_DIGITAL_CHANNELS: usize = 16;

/// Static model definition for a supported oscilloscope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigolModel {
    /// Model string exactly as reported in `*IDN?` (e.g. "DS1104Z").
    pub name: &'static str,
    pub series: Series,
    pub analog_channels: usize,
    /// Whether the model has a 16-channel logic analyzer.
    pub has_digital: bool,
}

impl RigolModel {
    pub fn protocol(&self) -> Protocol {
        self.series.protocol
    }
}

const fn model(name: &'static str, series: Series, analog_channels: usize, has_digital: bool) -> RigolModel {
    RigolModel {
        name,
        series,
        analog_channels,
        has_digital,
    }
}

/// Every supported model.
pub fn all_models() -> Vec<RigolModel> {
    vec![
        model("VS5022", VS5000, 2, false),
        model("VS5042", VS5000, 2, false),
        model("VS5062", VS5000, 2, false),
        model("VS5102", VS5000, 2, false),
        model("VS5202", VS5000, 2, false),
        model("VS5022D", VS5000, 2, true),
        model("VS5042D", VS5000, 2, true),
        model("VS5062D", VS5000, 2, true),
        model("VS5102D", VS5000, 2, true),
        model("VS5202D", VS5000, 2, true),
        model("DS1052E", DS1000, 2, false),
        model("DS1102E", DS1000, 2, false),
        model("DS1152E", DS1000, 2, false),
        model("DS1052D", DS1000, 2, true),
        model("DS1102D", DS1000, 2, true),
        model("DS1152D", DS1000, 2, true),
        model("DS2072", DS2000, 2, false),
        model("DS2102", DS2000, 2, false),
        model("DS2202", DS2000, 2, false),
        model("DS2302", DS2000, 2, false),
        model("DS2072A", DS2000A, 2, false),
        model("DS2102A", DS2000A, 2, false),
        model("DS2202A", DS2000A, 2, false),
        model("DS2302A", DS2000A, 2, false),
        model("MSO2072A", DS2000A, 2, true),
        model("MSO2102A", DS2000A, 2, true),
        model("MSO2202A", DS2000A, 2, true),
        model("MSO2302A", DS2000A, 2, true),
        model("DSO1002A", DSO1000, 2, false),
        model("DSO1004A", DSO1000, 4, false),
        model("DSO1012A", DSO1000, 2, false),
        model("DSO1014A", DSO1000, 4, false),
        model("DSO1022A", DSO1000, 2, false),
        model("DSO1024A", DSO1000, 4, false),
        model("DS1054Z", DS1000Z, 4, false),
        model("DS1074Z", DS1000Z, 4, false),
        model("DS1104Z", DS1000Z, 4, false),
        model("DS1074Z-S", DS1000Z, 4, false),
        model("DS1104Z-S", DS1000Z, 4, false),
        model("DS1102Z-E", DS1000Z, 2, false),
        model("DS1202Z-E", DS1000Z, 2, false),
        model("MSO1074Z", DS1000Z, 4, true),
        model("MSO1104Z", DS1000Z, 4, true),
        model("DS4024", DS4000, 4, false),
    ]
}

/// Look up a model from the manufacturer and model fields of `*IDN?`.
///
/// The manufacturer is compared case-insensitively against the vendor's
/// full name; the model must match exactly.
pub fn find_model(manufacturer: &str, model_name: &str) -> Option<RigolModel> {
    all_models().into_iter().find(|m| {
        manufacturer.eq_ignore_ascii_case(m.series.vendor.full_name()) && m.name == model_name
    })
}

/// Whether DS1000 firmware `version` predates IEEE-488.2 block output
/// (0.2.4).
///
/// Versions that do not have three numeric leading components are assumed
/// to be current.
pub fn firmware_uses_legacy_format(version: &str) -> bool {
    let mut parts = version.split('.');
    let mut n = [0i64; 3];
    for slot in &mut n {
        match parts.next().map(str::parse::<i64>) {
            Some(Ok(v)) => *slot = v,
            _ => return false,
        }
    }
    n[0] * 100 + n[1] * 10 + n[2] < 24
}

/// Data format actually used by `model` running `firmware_version`.
pub fn data_format(model: &RigolModel, firmware_version: &str) -> DataFormat {
    if model.series == DS1000 && firmware_uses_legacy_format(firmware_version) {
        tracing::debug!(firmware = firmware_version, "DS1000 firmware < 0.2.4, using legacy data format");
        DataFormat::Legacy
    } else {
        model.series.format
    }
}
