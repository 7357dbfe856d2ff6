//! Minimal MAVLink v1 framing for the reboot-to-bootloader command.
//!
//! Only one frame is ever sent: `COMMAND_LONG` carrying
//! `MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN` with param1 = 3 (reboot autopilot
//! and hold in bootloader). The generated message-table machinery of a
//! full MAVLink stack is deliberately absent; this module hand-frames the
//! single packet the reboot strategy needs.
//!
//! ```text
//! +------+-----+-----+-------+--------+-------+---------+------+------+
//! | 0xFE | len | seq | sysid | compid | msgid | payload | ck_a | ck_b |
//! +------+-----+-----+-------+--------+-------+---------+------+------+
//! ```

use byteorder::{LittleEndian, WriteBytesExt};

/// MAVLink v1 frame start marker.
pub const STX_V1: u8 = 0xFE;
/// `COMMAND_LONG` message id.
pub const MSG_COMMAND_LONG: u8 = 76;
/// Per-message CRC seed for `COMMAND_LONG`.
const COMMAND_LONG_CRC_EXTRA: u8 = 152;
/// `MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN`.
pub const CMD_PREFLIGHT_REBOOT_SHUTDOWN: u16 = 246;
/// param1 value requesting "reboot autopilot and keep it in bootloader".
pub const REBOOT_HOLD_IN_BOOTLOADER: f32 = 3.0;

/// System id this library claims when acting as a ground station.
const GCS_SYSTEM_ID: u8 = 255;
/// Component id this library claims (MAV_COMP_ID_MISSIONPLANNER).
const GCS_COMPONENT_ID: u8 = 190;

/// Accumulate one byte into the X25 (CRC-16/MCRF4XX) checksum.
fn crc_accumulate(byte: u8, crc: u16) -> u16 {
    let mut tmp = byte ^ (crc & 0xFF) as u8;
    tmp ^= tmp << 4;
    (crc >> 8) ^ (u16::from(tmp) << 8) ^ (u16::from(tmp) << 3) ^ (u16::from(tmp) >> 4)
}

/// X25 checksum over `data`, seeded 0xFFFF.
fn crc_x25(data: &[u8], extra: u8) -> u16 {
    let mut crc = 0xFFFFu16;
    for &b in data {
        crc = crc_accumulate(b, crc);
    }
    crc_accumulate(extra, crc)
}

/// Build the `COMMAND_LONG` frame that reboots a flight controller into
/// its bootloader.
///
/// `target_system`/`target_component` of 0 broadcast to any autopilot,
/// which is what a flasher wants when it has not spoken MAVLink yet.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn reboot_to_bootloader_frame(target_system: u8, target_component: u8) -> Vec<u8> {
    // COMMAND_LONG payload, v1 field order:
    // param1..param7 (7 x f32), command (u16), target_system,
    // target_component, confirmation = 33 bytes.
    let mut payload = Vec::with_capacity(33);
    payload
        .write_f32::<LittleEndian>(REBOOT_HOLD_IN_BOOTLOADER)
        .unwrap();
    for _ in 0..6 {
        payload.write_f32::<LittleEndian>(0.0).unwrap();
    }
    payload
        .write_u16::<LittleEndian>(CMD_PREFLIGHT_REBOOT_SHUTDOWN)
        .unwrap();
    payload.push(target_system);
    payload.push(target_component);
    payload.push(0); // confirmation

    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push(STX_V1);
    // Safe cast, payload is 33 bytes
    frame.push(payload.len() as u8);
    frame.push(0); // sequence
    frame.push(GCS_SYSTEM_ID);
    frame.push(GCS_COMPONENT_ID);
    frame.push(MSG_COMMAND_LONG);
    frame.extend_from_slice(&payload);

    // Checksum covers everything after STX, plus the per-message extra.
    let crc = crc_x25(&frame[1..], COMMAND_LONG_CRC_EXTRA);
    frame.write_u16::<LittleEndian>(crc).unwrap();

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x25_known_vector() {
        // CRC-16/MCRF4XX of "123456789" is 0x6F91.
        let mut crc = 0xFFFFu16;
        for &b in b"123456789" {
            crc = crc_accumulate(b, crc);
        }
        assert_eq!(crc, 0x6F91);
    }

    #[test]
    fn test_reboot_frame_layout() {
        let frame = reboot_to_bootloader_frame(1, 1);

        assert_eq!(frame.len(), 8 + 33);
        assert_eq!(frame[0], STX_V1);
        assert_eq!(frame[1], 33); // payload length
        assert_eq!(frame[5], MSG_COMMAND_LONG);

        // param1 = 3.0 little-endian
        assert_eq!(&frame[6..10], &3.0f32.to_le_bytes());

        // command id at payload offset 28
        let cmd = u16::from_le_bytes([frame[6 + 28], frame[6 + 29]]);
        assert_eq!(cmd, CMD_PREFLIGHT_REBOOT_SHUTDOWN);

        // target system/component
        assert_eq!(frame[6 + 30], 1);
        assert_eq!(frame[6 + 31], 1);
    }

    #[test]
    fn test_reboot_frame_checksum_matches_recomputation() {
        let frame = reboot_to_bootloader_frame(0, 0);
        let body = &frame[1..frame.len() - 2];
        let crc = crc_x25(body, COMMAND_LONG_CRC_EXTRA);
        let tail = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        assert_eq!(crc, tail);
    }
}
