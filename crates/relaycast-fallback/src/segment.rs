//! Minimal MPEG-TS segment synthesis.
//!
//! The synthesized segment carries only a PAT and a PMT announcing one H.264
//! and one AAC stream, with no PES data. It is a well-formed transport stream
//! that keeps a fallback playlist free of dangling references, but players
//! find no samples in it and show nothing. Configure a pre-rendered slate for
//! visible fallback content.

/// Size of one transport stream packet.
pub const TS_PACKET_SIZE: usize = 188;

const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const AUDIO_PID: u16 = 0x0101;
const PROGRAM_NUMBER: u16 = 1;
const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_AAC: u8 = 0x0F;

const CRC32_POLY: u32 = 0x04C1_1DB7;

static CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ CRC32_POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC-32/MPEG-2 as used by PSI sections.
pub fn crc32_mpeg(data: &[u8]) -> u32 {
    data.iter().fold(0xFFFF_FFFF, |crc, &byte| {
        (crc << 8) ^ CRC32_TABLE[((crc >> 24) ^ byte as u32) as usize]
    })
}

/// Bytes of a sample-free segment holding only the program tables.
pub fn synthesize_segment() -> Vec<u8> {
    let mut out = Vec::with_capacity(TS_PACKET_SIZE * 2);
    out.extend_from_slice(&psi_packet(PAT_PID, &pat_section()));
    out.extend_from_slice(&psi_packet(PMT_PID, &pmt_section()));
    out
}

fn pat_section() -> Vec<u8> {
    let mut body = vec![
        (PROGRAM_NUMBER >> 8) as u8,
        PROGRAM_NUMBER as u8,
        0xE0 | ((PMT_PID >> 8) as u8 & 0x1F),
        PMT_PID as u8,
    ];
    section(0x00, 1, &mut body)
}

fn pmt_section() -> Vec<u8> {
    let mut body = vec![
        // PCR PID
        0xE0 | ((VIDEO_PID >> 8) as u8 & 0x1F),
        VIDEO_PID as u8,
        // program_info_length
        0xF0,
        0x00,
    ];
    for (stream_type, pid) in [(STREAM_TYPE_H264, VIDEO_PID), (STREAM_TYPE_AAC, AUDIO_PID)] {
        body.extend_from_slice(&[
            stream_type,
            0xE0 | ((pid >> 8) as u8 & 0x1F),
            pid as u8,
            0xF0,
            0x00,
        ]);
    }
    section(0x02, PROGRAM_NUMBER, &mut body)
}

/// Long-form section: header, body, CRC.
fn section(table_id: u8, extension: u16, body: &mut Vec<u8>) -> Vec<u8> {
    // extension(2) + version(1) + section numbers(2) + body + crc(4)
    let section_length = 5 + body.len() + 4;
    let mut data = Vec::with_capacity(3 + section_length);
    data.push(table_id);
    data.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    data.push(section_length as u8);
    data.push((extension >> 8) as u8);
    data.push(extension as u8);
    // version 0, current
    data.push(0xC1);
    data.push(0);
    data.push(0);
    data.append(body);

    let crc = crc32_mpeg(&data);
    data.extend_from_slice(&crc.to_be_bytes());
    data
}

fn psi_packet(pid: u16, section: &[u8]) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0xFFu8; TS_PACKET_SIZE];
    packet[0] = SYNC_BYTE;
    // payload_unit_start_indicator set
    packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
    packet[2] = pid as u8;
    // payload only, continuity counter 0
    packet[3] = 0x10;
    // pointer field
    packet[4] = 0x00;
    let len = section.len().min(TS_PACKET_SIZE - 5);
    packet[5..5 + len].copy_from_slice(&section[..len]);
    packet
}
