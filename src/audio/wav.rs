//! Minimal WAVE container for PCM payloads.
//!
//! Layout (44-byte header, little-endian):
//!
//! | offset | field                         |
//! |--------|-------------------------------|
//! | 0      | `RIFF`                        |
//! | 4      | file size - 8                 |
//! | 8      | `WAVE`                        |
//! | 12     | `fmt ` + chunk size 16        |
//! | 20     | format 1 (PCM), channels      |
//! | 24     | sample rate, byte rate        |
//! | 32     | block align, bits per sample  |
//! | 36     | `data` + payload size         |

use crate::audio::processor::PcmFormat;
use byteorder::{LittleEndian, WriteBytesExt};

pub const WAV_HEADER_LEN: usize = 44;

const PCM_FORMAT_CODE: u16 = 1;

/// Wrap raw PCM bytes in a WAVE container.
pub fn encode_wav(pcm: &[u8], format: PcmFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    let data_len = pcm.len() as u32;

    // Writes into a Vec cannot fail
    let _ = write_header(&mut out, data_len, format);
    out.extend_from_slice(pcm);
    out
}

fn write_header(out: &mut Vec<u8>, data_len: u32, format: PcmFormat) -> std::io::Result<()> {
    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(36 + data_len)?;
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.write_u32::<LittleEndian>(16)?;
    out.write_u16::<LittleEndian>(PCM_FORMAT_CODE)?;
    out.write_u16::<LittleEndian>(format.channels)?;
    out.write_u32::<LittleEndian>(format.sample_rate)?;
    out.write_u32::<LittleEndian>(format.byte_rate())?;
    out.write_u16::<LittleEndian>(format.block_align())?;
    out.write_u16::<LittleEndian>(format.bit_depth)?;

    out.extend_from_slice(b"data");
    out.write_u32::<LittleEndian>(data_len)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use std::io::Cursor;

    #[test]
    fn test_header_layout() {
        let pcm = vec![1u8, 0, 2, 0, 3, 0];
        let wav = encode_wav(&pcm, PcmFormat::new(22050, 1, 16));

        assert_eq!(wav.len(), WAV_HEADER_LEN + pcm.len());
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(&wav[44..], &pcm[..]);

        let mut cursor = Cursor::new(&wav[4..8]);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 36 + 6);

        let mut fmt = Cursor::new(&wav[16..36]);
        assert_eq!(fmt.read_u32::<LittleEndian>().unwrap(), 16);
        assert_eq!(fmt.read_u16::<LittleEndian>().unwrap(), 1);
        assert_eq!(fmt.read_u16::<LittleEndian>().unwrap(), 1);
        assert_eq!(fmt.read_u32::<LittleEndian>().unwrap(), 22050);
        assert_eq!(fmt.read_u32::<LittleEndian>().unwrap(), 44100);
        assert_eq!(fmt.read_u16::<LittleEndian>().unwrap(), 2);
        assert_eq!(fmt.read_u16::<LittleEndian>().unwrap(), 16);

        let mut data_len = Cursor::new(&wav[40..44]);
        assert_eq!(data_len.read_u32::<LittleEndian>().unwrap(), 6);
    }
}
