//! CTAPHID framing and protocol driver
//!
//! Packet format:
//! - Initialization packet: CID(4) + CMD(1, high bit set) + BCNT(2, big endian) + DATA(57)
//! - Continuation packet: CID(4) + SEQ(1) + DATA(59)
//!
//! [`FidoProtocol`] allocates a channel with CTAPHID_INIT on the broadcast
//! CID, then exchanges complete messages, routing keepalives to a
//! [`CommandState`] and honoring cancellation with CTAPHID_CANCEL.

use rand::Rng;
use tracing::debug;

use ykey_core::error::{Error, Result};
use ykey_core::state::{CommandState, KeepAliveStatus};
use ykey_core::version::Version;

use crate::connection::FidoConnection;

/// HID packet size (fixed at 64 bytes for USB HID)
pub const PACKET_SIZE: usize = 64;

/// Maximum CTAP message size (57 + 128 * 59 bytes)
pub const MAX_MESSAGE_SIZE: usize = 7609;

/// Channel ID used before a channel has been allocated
pub const BROADCAST_CID: u32 = 0xFFFFFFFF;

/// First command byte of the vendor-specific range
pub const CTAP_VENDOR_FIRST: u8 = 0x40;

const INIT_PACKET_DATA_SIZE: usize = 57;
const CONT_PACKET_DATA_SIZE: usize = 59;

const KEEPALIVE_PROCESSING: u8 = 0x01;
const KEEPALIVE_UP_NEEDED: u8 = 0x02;

/// CTAPHID commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtapHidCommand {
    /// Echo transaction
    Ping,
    /// Allocate a new CID or synchronize a channel
    Init,
    /// Request visual identification
    Wink,
    /// Encapsulated CTAP2 CBOR message
    Cbor,
    /// Cancel the outstanding request on this CID
    Cancel,
    /// The request is still being processed
    Keepalive,
    /// Error response
    Error,
    /// Vendor-specific command (0x40..0x7F), used for Management-over-FIDO
    Vendor(u8),
}

impl CtapHidCommand {
    /// Convert from a command byte, masking off the TYPE bit
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x7F {
            0x01 => Some(CtapHidCommand::Ping),
            0x06 => Some(CtapHidCommand::Init),
            0x08 => Some(CtapHidCommand::Wink),
            0x10 => Some(CtapHidCommand::Cbor),
            0x11 => Some(CtapHidCommand::Cancel),
            0x3B => Some(CtapHidCommand::Keepalive),
            0x3F => Some(CtapHidCommand::Error),
            value if value >= CTAP_VENDOR_FIRST => Some(CtapHidCommand::Vendor(value)),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            CtapHidCommand::Ping => 0x01,
            CtapHidCommand::Init => 0x06,
            CtapHidCommand::Wink => 0x08,
            CtapHidCommand::Cbor => 0x10,
            CtapHidCommand::Cancel => 0x11,
            CtapHidCommand::Keepalive => 0x3B,
            CtapHidCommand::Error => 0x3F,
            CtapHidCommand::Vendor(value) => value & 0x7F,
        }
    }

    /// Command byte with the TYPE bit set, as carried in an INIT packet
    pub fn to_u8_init(self) -> u8 {
        self.to_u8() | 0x80
    }
}

/// A single 64-byte HID packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: [u8; PACKET_SIZE],
}

impl Packet {
    pub fn from_bytes(data: [u8; PACKET_SIZE]) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.data
    }

    pub fn cid(&self) -> u32 {
        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Whether this is an initialization packet
    pub fn is_init(&self) -> bool {
        (self.data[4] & 0x80) != 0
    }

    /// Command (only valid for initialization packets)
    pub fn cmd(&self) -> Option<CtapHidCommand> {
        if !self.is_init() {
            return None;
        }
        CtapHidCommand::from_u8(self.data[4])
    }

    /// Total payload length (only valid for initialization packets)
    pub fn payload_len(&self) -> Option<u16> {
        if !self.is_init() {
            return None;
        }
        Some(u16::from_be_bytes([self.data[5], self.data[6]]))
    }

    /// Sequence number (only valid for continuation packets)
    pub fn seq(&self) -> Option<u8> {
        if self.is_init() {
            return None;
        }
        Some(self.data[4])
    }

    pub fn payload(&self) -> &[u8] {
        if self.is_init() {
            &self.data[7..]
        } else {
            &self.data[5..]
        }
    }

    /// Fragment a message into an INIT packet plus continuation packets
    pub fn fragment(cid: u32, cmd: CtapHidCommand, data: &[u8]) -> Result<Vec<Self>> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::NotSupported(
                "message exceeds CTAPHID maximum size".into(),
            ));
        }

        let mut packets = Vec::with_capacity(1 + data.len() / CONT_PACKET_DATA_SIZE);

        let mut init_packet = [0u8; PACKET_SIZE];
        init_packet[0..4].copy_from_slice(&cid.to_be_bytes());
        init_packet[4] = cmd.to_u8_init();
        init_packet[5..7].copy_from_slice(&(data.len() as u16).to_be_bytes());
        let init_data_len = data.len().min(INIT_PACKET_DATA_SIZE);
        init_packet[7..7 + init_data_len].copy_from_slice(&data[..init_data_len]);
        packets.push(Packet::from_bytes(init_packet));

        let mut remaining = &data[init_data_len..];
        let mut seq = 0u8;
        while !remaining.is_empty() {
            let mut cont_packet = [0u8; PACKET_SIZE];
            cont_packet[0..4].copy_from_slice(&cid.to_be_bytes());
            cont_packet[4] = seq;
            let cont_data_len = remaining.len().min(CONT_PACKET_DATA_SIZE);
            cont_packet[5..5 + cont_data_len].copy_from_slice(&remaining[..cont_data_len]);
            packets.push(Packet::from_bytes(cont_packet));
            remaining = &remaining[cont_data_len..];
            // The size check above caps seq at 127
            seq += 1;
        }

        Ok(packets)
    }
}

/// Protocol driver for one open FIDO HID channel
pub struct FidoProtocol<C: FidoConnection> {
    connection: C,
    cid: u32,
    hid_version: u8,
    capabilities: u8,
    version: Version,
}

impl<C: FidoConnection> FidoProtocol<C> {
    /// Allocate a channel and read the device identity
    ///
    /// Sends CTAPHID_INIT with a fresh 8-byte nonce on the broadcast CID and
    /// adopts the CID the device allocates.
    pub fn new(connection: C) -> Result<Self> {
        let mut protocol = Self {
            connection,
            cid: BROADCAST_CID,
            hid_version: 0,
            capabilities: 0,
            version: Version::default(),
        };
        let nonce: [u8; 8] = rand::thread_rng().gen();
        let response = protocol.send_and_receive(CtapHidCommand::Init, &nonce, None)?;
        if response.len() < 17 {
            return Err(Error::bad_response("short CTAPHID_INIT response"));
        }
        if response[..8] != nonce {
            return Err(Error::bad_response("CTAPHID_INIT nonce mismatch"));
        }
        protocol.cid = u32::from_be_bytes([response[8], response[9], response[10], response[11]]);
        protocol.hid_version = response[12];
        protocol.version = Version::new(response[13], response[14], response[15]);
        protocol.capabilities = response[16];
        debug!(
            cid = format_args!("{:08x}", protocol.cid),
            version = %protocol.version,
            capabilities = protocol.capabilities,
            "allocated CTAPHID channel"
        );
        Ok(protocol)
    }

    /// Device firmware version reported in the INIT response
    pub fn version(&self) -> Version {
        self.version
    }

    /// Capability flags reported in the INIT response
    pub fn capabilities(&self) -> u8 {
        self.capabilities
    }

    /// Send a complete message and block until the response message arrives
    ///
    /// Keepalive packets are reported to `state` and do not terminate the
    /// wait. When `state` is cancelled, CTAPHID_CANCEL is sent once; the
    /// device then fails the transaction with a CTAP error.
    pub fn send_and_receive(
        &mut self,
        cmd: CtapHidCommand,
        payload: &[u8],
        state: Option<&CommandState>,
    ) -> Result<Vec<u8>> {
        for packet in Packet::fragment(self.cid, cmd, payload)? {
            self.connection.send(packet.as_bytes())?;
        }
        self.read_response(cmd, state)
    }

    fn read_response(
        &mut self,
        cmd: CtapHidCommand,
        state: Option<&CommandState>,
    ) -> Result<Vec<u8>> {
        let mut cancel_sent = false;

        let (total_len, mut data) = loop {
            let packet = self.read_packet()?;
            if packet.cid() != self.cid {
                return Err(Error::bad_response(format!(
                    "response on wrong channel 0x{:08x}",
                    packet.cid()
                )));
            }
            if !packet.is_init() {
                return Err(Error::bad_response(
                    "continuation packet while waiting for response",
                ));
            }
            match packet.cmd() {
                Some(CtapHidCommand::Keepalive) => {
                    let status = match packet.payload().first() {
                        Some(&KEEPALIVE_UP_NEEDED) => KeepAliveStatus::UpNeeded,
                        _ => KeepAliveStatus::Processing,
                    };
                    if let Some(state) = state {
                        state.on_keepalive(status);
                        if state.is_cancelled() && !cancel_sent {
                            debug!("cancelling pending CTAPHID transaction");
                            for packet in
                                Packet::fragment(self.cid, CtapHidCommand::Cancel, &[])?
                            {
                                self.connection.send(packet.as_bytes())?;
                            }
                            cancel_sent = true;
                        }
                    }
                    continue;
                }
                Some(CtapHidCommand::Error) => {
                    let code = packet.payload().first().copied().unwrap_or(0x7F);
                    return Err(Error::Ctap(code));
                }
                Some(response_cmd) if response_cmd == cmd => {
                    let total_len = packet.payload_len().unwrap_or(0) as usize;
                    if total_len > MAX_MESSAGE_SIZE {
                        return Err(Error::bad_response("response exceeds maximum size"));
                    }
                    let take = total_len.min(INIT_PACKET_DATA_SIZE);
                    break (total_len, packet.payload()[..take].to_vec());
                }
                _ => {
                    return Err(Error::bad_response("unexpected response command"));
                }
            }
        };

        let mut expected_seq = 0u8;
        while data.len() < total_len {
            let packet = self.read_packet()?;
            if packet.cid() != self.cid {
                return Err(Error::bad_response("continuation on wrong channel"));
            }
            let seq = packet
                .seq()
                .ok_or_else(|| Error::bad_response("init packet during reassembly"))?;
            if seq != expected_seq {
                return Err(Error::bad_response(format!(
                    "continuation out of order: expected {}, got {}",
                    expected_seq, seq
                )));
            }
            expected_seq += 1;
            let take = (total_len - data.len()).min(CONT_PACKET_DATA_SIZE);
            data.extend_from_slice(&packet.payload()[..take]);
        }

        Ok(data)
    }

    fn read_packet(&mut self) -> Result<Packet> {
        let mut buffer = [0u8; PACKET_SIZE];
        self.connection.receive(&mut buffer)?;
        Ok(Packet::from_bytes(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const TEST_CID: u32 = 0x1234_5678;

    struct MockFido {
        sent: Vec<[u8; PACKET_SIZE]>,
        responses: VecDeque<[u8; PACKET_SIZE]>,
        answer_init: bool,
    }

    impl MockFido {
        fn new() -> Self {
            Self {
                sent: Vec::new(),
                responses: VecDeque::new(),
                answer_init: false,
            }
        }

        fn queue_message(&mut self, cid: u32, cmd: CtapHidCommand, data: &[u8]) {
            for packet in Packet::fragment(cid, cmd, data).unwrap() {
                self.responses.push_back(*packet.as_bytes());
            }
        }
    }

    impl FidoConnection for MockFido {
        fn send(&mut self, packet: &[u8; PACKET_SIZE]) -> Result<()> {
            if self.answer_init && packet[4] == CtapHidCommand::Init.to_u8_init() {
                let mut payload = [0u8; 17];
                payload[..8].copy_from_slice(&packet[7..15]);
                payload[8..12].copy_from_slice(&TEST_CID.to_be_bytes());
                payload[12] = 2;
                payload[13..16].copy_from_slice(&[5, 4, 3]);
                payload[16] = 0x05;
                self.queue_message(BROADCAST_CID, CtapHidCommand::Init, &payload);
            }
            self.sent.push(*packet);
            Ok(())
        }

        fn receive(&mut self, packet: &mut [u8; PACKET_SIZE]) -> Result<()> {
            let next = self.responses.pop_front().ok_or(Error::Timeout)?;
            packet.copy_from_slice(&next);
            Ok(())
        }
    }

    #[test]
    fn test_command_conversion() {
        assert_eq!(CtapHidCommand::from_u8(0x10), Some(CtapHidCommand::Cbor));
        assert_eq!(CtapHidCommand::from_u8(0x90), Some(CtapHidCommand::Cbor));
        assert_eq!(
            CtapHidCommand::from_u8(0x42),
            Some(CtapHidCommand::Vendor(0x42))
        );
        assert_eq!(CtapHidCommand::from_u8(0x02), None);
        assert_eq!(CtapHidCommand::Cbor.to_u8_init(), 0x90);
        assert_eq!(CtapHidCommand::Vendor(0x43).to_u8_init(), 0xC3);
    }

    #[test]
    fn test_fragment_single_packet() {
        let packets = Packet::fragment(TEST_CID, CtapHidCommand::Ping, &[1, 2, 3]).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].cid(), TEST_CID);
        assert_eq!(packets[0].cmd(), Some(CtapHidCommand::Ping));
        assert_eq!(packets[0].payload_len(), Some(3));
        assert_eq!(&packets[0].payload()[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_fragment_multi_packet() {
        let data = vec![0x42u8; 150];
        let packets = Packet::fragment(TEST_CID, CtapHidCommand::Cbor, &data).unwrap();
        // 57 + 59 + 34
        assert_eq!(packets.len(), 3);
        assert!(packets[0].is_init());
        assert_eq!(packets[1].seq(), Some(0));
        assert_eq!(packets[2].seq(), Some(1));
    }

    #[test]
    fn test_fragment_too_large() {
        let data = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert!(Packet::fragment(TEST_CID, CtapHidCommand::Cbor, &data).is_err());
    }

    fn connected_protocol(mock: MockFido) -> FidoProtocol<MockFido> {
        let mut mock = mock;
        mock.answer_init = true;
        let mut protocol = FidoProtocol::new(mock).unwrap();
        protocol.connection.answer_init = false;
        protocol
    }

    #[test]
    fn test_channel_allocation() {
        let protocol = connected_protocol(MockFido::new());
        assert_eq!(protocol.cid, TEST_CID);
        assert_eq!(protocol.version(), Version::new(5, 4, 3));
        assert_eq!(protocol.capabilities(), 0x05);
    }

    #[test]
    fn test_round_trip_multi_packet() {
        let mut protocol = connected_protocol(MockFido::new());
        let reply = vec![0x33u8; 200];
        protocol
            .connection
            .queue_message(TEST_CID, CtapHidCommand::Cbor, &reply);
        let response = protocol
            .send_and_receive(CtapHidCommand::Cbor, &[0x04], None)
            .unwrap();
        assert_eq!(response, reply);
    }

    #[test]
    fn test_out_of_order_continuation_fails() {
        let mut protocol = connected_protocol(MockFido::new());
        let reply = vec![0x33u8; 200];
        for packet in Packet::fragment(TEST_CID, CtapHidCommand::Cbor, &reply).unwrap() {
            let mut bytes = *packet.as_bytes();
            if packet.seq() == Some(0) {
                // Skip ahead in the sequence
                bytes[4] = 1;
            }
            protocol.connection.responses.push_back(bytes);
        }
        let err = protocol
            .send_and_receive(CtapHidCommand::Cbor, &[0x04], None)
            .unwrap_err();
        assert!(matches!(err, Error::BadResponse(_)));
    }

    #[test]
    fn test_wrong_channel_fails() {
        let mut protocol = connected_protocol(MockFido::new());
        protocol
            .connection
            .queue_message(0xDEAD_BEEF, CtapHidCommand::Cbor, &[0x00]);
        let err = protocol
            .send_and_receive(CtapHidCommand::Cbor, &[0x04], None)
            .unwrap_err();
        assert!(matches!(err, Error::BadResponse(_)));
    }

    #[test]
    fn test_keepalive_then_response() {
        let mut protocol = connected_protocol(MockFido::new());
        protocol
            .connection
            .queue_message(TEST_CID, CtapHidCommand::Keepalive, &[0x02]);
        protocol
            .connection
            .queue_message(TEST_CID, CtapHidCommand::Keepalive, &[0x01]);
        protocol
            .connection
            .queue_message(TEST_CID, CtapHidCommand::Cbor, &[0x00]);

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        let state = CommandState::with_observer(move |status| {
            log.lock().unwrap().push(status);
        });
        let response = protocol
            .send_and_receive(CtapHidCommand::Cbor, &[0x04], Some(&state))
            .unwrap();
        assert_eq!(response, vec![0x00]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![KeepAliveStatus::UpNeeded, KeepAliveStatus::Processing]
        );
    }

    #[test]
    fn test_error_packet() {
        let mut protocol = connected_protocol(MockFido::new());
        protocol
            .connection
            .queue_message(TEST_CID, CtapHidCommand::Error, &[0x2D]);
        let err = protocol
            .send_and_receive(CtapHidCommand::Cbor, &[0x04], None)
            .unwrap_err();
        assert_eq!(err, Error::Ctap(0x2D));
    }

    #[test]
    fn test_cancel_sent_once() {
        let mut protocol = connected_protocol(MockFido::new());
        for _ in 0..3 {
            protocol
                .connection
                .queue_message(TEST_CID, CtapHidCommand::Keepalive, &[0x01]);
        }
        protocol
            .connection
            .queue_message(TEST_CID, CtapHidCommand::Error, &[0x2D]);

        let state = CommandState::new();
        state.cancel();
        let err = protocol
            .send_and_receive(CtapHidCommand::Cbor, &[0x04], Some(&state))
            .unwrap_err();
        assert_eq!(err, Error::Ctap(0x2D));

        let cancels = protocol
            .connection
            .sent
            .iter()
            .filter(|packet| packet[4] == CtapHidCommand::Cancel.to_u8_init())
            .count();
        assert_eq!(cancels, 1);
    }

    #[test]
    fn test_vendor_command_round_trip() {
        let mut protocol = connected_protocol(MockFido::new());
        protocol
            .connection
            .queue_message(TEST_CID, CtapHidCommand::Vendor(0x42), &[0x05, 0x01, 0x02]);
        let response = protocol
            .send_and_receive(CtapHidCommand::Vendor(0x42), &[], None)
            .unwrap();
        assert_eq!(response, vec![0x05, 0x01, 0x02]);
    }
}
