//! Wire framing for the parent build-hook protocol, and the log sanitizer
//! that turns a raw remote-job byte stream into clean log lines.

pub mod sanitizer;
pub mod wire;

pub use sanitizer::{LogSanitizer, SanitizerOutcome};
pub use wire::{Error, Reader, Writer};

/// A single build request as read off the wire, per SPEC_FULL.md §4.1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildRequest {
    pub inherited_settings: Vec<(String, String)>,
    pub am_willing: u64,
    pub needed_system: String,
    pub drv_path: String,
    pub required_features: Vec<String>,
    pub inputs: Vec<String>,
    pub wanted_outputs: Vec<String>,
}

/// Outcome of reading the fixed header of the protocol: either the parent
/// wants to proceed ("try"), or it does not and the hook should exit
/// silently.
pub enum HeaderOutcome {
    Try(BuildRequest),
    NotTrying,
}

/// Reads everything through `requiredFeatures` (the fields that are always
/// present, regardless of whether this hook accepts the job). `inputs` and
/// `wantedOutputs` are read separately via [`Reader::read_accepted_tail`]
/// only after the hook has written its accept token.
pub fn read_header<R: std::io::Read>(reader: &mut Reader<R>) -> Result<HeaderOutcome, Error> {
    let inherited_settings = reader.read_settings()?;
    let verb = reader.read_string()?;
    if verb != "try" {
        return Ok(HeaderOutcome::NotTrying);
    }
    let am_willing = reader.read_u64()?;
    let needed_system = reader.read_string()?;
    let drv_path = reader.read_string()?;
    let required_features = reader.read_string_list()?;
    Ok(HeaderOutcome::Try(BuildRequest {
        inherited_settings,
        am_willing,
        needed_system,
        drv_path,
        required_features,
        inputs: Vec::new(),
        wanted_outputs: Vec::new(),
    }))
}
