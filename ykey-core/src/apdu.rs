//! ISO 7816-4 command APDUs and status words

/// Status word constants returned by YubiKey applications
pub mod sw {
    pub const OK: u16 = 0x9000;
    pub const NO_INPUT_DATA: u16 = 0x6285;
    pub const VERIFY_FAIL_NO_RETRY: u16 = 0x63C0;
    pub const MEMORY_ERROR: u16 = 0x6581;
    pub const WRONG_LENGTH: u16 = 0x6700;
    pub const SECURITY_CONDITION_NOT_SATISFIED: u16 = 0x6982;
    pub const AUTH_METHOD_BLOCKED: u16 = 0x6983;
    pub const DATA_INVALID: u16 = 0x6984;
    pub const CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    pub const COMMAND_NOT_ALLOWED: u16 = 0x6986;
    pub const INCORRECT_PARAMETERS: u16 = 0x6A80;
    pub const FUNCTION_NOT_SUPPORTED: u16 = 0x6A81;
    pub const FILE_NOT_FOUND: u16 = 0x6A82;
    pub const NO_SPACE: u16 = 0x6A84;
    pub const REFERENCE_DATA_NOT_FOUND: u16 = 0x6A88;
    pub const APPLET_SELECT_FAILED: u16 = 0x6999;
    pub const WRONG_PARAMETERS_P1P2: u16 = 0x6B00;
    pub const INVALID_INSTRUCTION: u16 = 0x6D00;
    pub const COMMAND_ABORTED: u16 = 0x6F00;

    /// First status byte signalling that more response bytes are available
    pub const SW1_HAS_MORE_DATA: u8 = 0x61;
    /// First status byte signalling a wrong Le field, correct value in SW2
    pub const SW1_WRONG_LENGTH_LE: u8 = 0x6C;
}

/// A single ISO 7816-4 command
///
/// Encoding into short or extended form (and command chaining for oversized
/// payloads) is done by the smartcard protocol driver, which knows what the
/// connection supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    le: u32,
}

impl Apdu {
    /// Create a new command with the given header and data field
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: data.into(),
            le: 0,
        }
    }

    /// Set the expected response length (Le)
    ///
    /// 256 encodes as `0x00` in short form, 65536 as `0x0000` in extended
    /// form. Zero means no Le field.
    pub fn with_le(mut self, le: u32) -> Self {
        self.le = le;
        self
    }

    pub fn cla(&self) -> u8 {
        self.cla
    }

    pub fn ins(&self) -> u8 {
        self.ins
    }

    pub fn p1(&self) -> u8 {
        self.p1
    }

    pub fn p2(&self) -> u8 {
        self.p2
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn le(&self) -> u32 {
        self.le
    }
}
