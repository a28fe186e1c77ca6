//! Fixed layout header of binary trace files.
//!
//! | offset            | field                 | type                      |
//! |-------------------|-----------------------|---------------------------|
//! | 0                 | total trace count     | `u32` little-endian       |
//! | 4                 | samples per trace     | `u32` little-endian       |
//! | 8                 | sample type tag       | `b'f'`, `b'd'` or `b's'`  |
//! | 9 (`s` only)      | channel range code    | `u8`                      |
//! | 10 (`s` only)     | max ADC value         | `i16` little-endian       |
//! | 9 or 12           | plaintext length      | `u8`                      |
//! | next 16 bytes     | session key           | raw bytes                 |
//!
//! Rows of `samples * sample_width` bytes of leakage followed by `plaintext length` bytes of
//! plaintext are stored right after the header.
use num_traits::{AsPrimitive, FromBytes, ToBytes};
use std::io::{self, Read, Write};

use crate::Error;

/// Header length of files holding `f32` or `f64` samples.
pub const HEAD_SIZE: usize = 26;
/// Header length of files holding `i16` samples, which carry the ADC scale.
pub const HEAD_SIZE_SCALED: usize = 29;
/// Length of the session key stored in every header.
pub const KEY_LEN: usize = 16;

/// Input ranges of the oscilloscope channels in millivolts, indexed by range code.
const CHANNEL_RANGES_MV: [f64; 14] = [
    10., 20., 50., 100., 200., 500., 1000., 2000., 5000., 10000., 20000., 50000., 100000.,
    200000.,
];

/// Encoding of the samples in a trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Float32,
    Float64,
    /// Raw ADC codes, with the information needed to convert them to millivolts.
    Int16 { channel_range: u8, max_adc: i16 },
}

impl SampleType {
    /// Returns the ASCII tag identifying this sample type in a header.
    pub fn tag(&self) -> u8 {
        match self {
            SampleType::Float32 => b'f',
            SampleType::Float64 => b'd',
            SampleType::Int16 { .. } => b's',
        }
    }

    /// Returns the size in bytes of one sample.
    pub fn width(&self) -> usize {
        match self {
            SampleType::Float32 => 4,
            SampleType::Float64 => 8,
            SampleType::Int16 { .. } => 2,
        }
    }

    /// Decodes little-endian samples from `bytes` into `out`.
    ///
    /// # Panics
    /// Panics in debug if `bytes.len() != out.len() * self.width()`.
    pub(crate) fn decode(&self, bytes: &[u8], out: &mut [f64]) {
        debug_assert_eq!(bytes.len(), out.len() * self.width());

        match self {
            SampleType::Float32 => decode_as::<f32, 4>(bytes, out),
            SampleType::Float64 => decode_as::<f64, 8>(bytes, out),
            SampleType::Int16 { .. } => decode_as::<i16, 2>(bytes, out),
        }
    }

    /// Encodes `samples` in little-endian at the end of `out`.
    ///
    /// Integer samples are rounded to the nearest code and saturate at the `i16` bounds.
    pub(crate) fn encode(&self, samples: impl Iterator<Item = f64>, out: &mut Vec<u8>) {
        match self {
            SampleType::Float32 => encode_as::<f32>(samples, out),
            SampleType::Float64 => encode_as::<f64>(samples, out),
            SampleType::Int16 { .. } => encode_as::<i16>(samples.map(f64::round), out),
        }
    }
}

fn decode_as<T, const N: usize>(bytes: &[u8], out: &mut [f64])
where
    T: FromBytes<Bytes = [u8; N]> + AsPrimitive<f64>,
{
    let mut raw = [0; N];
    for (x, b) in out.iter_mut().zip(bytes.chunks_exact(N)) {
        raw.copy_from_slice(b);
        *x = T::from_le_bytes(&raw).as_();
    }
}

/// Float to integer conversions saturate at the bounds of `T`.
fn encode_as<T>(samples: impl Iterator<Item = f64>, out: &mut Vec<u8>)
where
    T: ToBytes + Copy + 'static,
    f64: AsPrimitive<T>,
{
    for x in samples {
        let sample: T = x.as_();
        out.extend_from_slice(sample.to_le_bytes().as_ref());
    }
}

/// Header of a binary trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    /// Number of rows stored after the header
    pub num_traces: u32,
    /// Number of samples in each trace
    pub num_samples: u32,
    pub sample_type: SampleType,
    /// Number of plaintext bytes in each row
    pub plaintext_len: u8,
    /// Key used for every encryption of the file
    pub key: [u8; KEY_LEN],
}

impl TraceHeader {
    /// Parses a header from the start of `reader`.
    ///
    /// Fails with [`Error::MalformedHeader`] on an unknown sample type tag or if the header is
    /// truncated.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, Error> {
        let mut buf = [0u8; 9];
        read_header_bytes(reader, &mut buf)?;

        let num_traces = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let num_samples = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let sample_type = match buf[8] {
            b'f' => SampleType::Float32,
            b'd' => SampleType::Float64,
            b's' => {
                let mut scale = [0u8; 3];
                read_header_bytes(reader, &mut scale)?;
                SampleType::Int16 {
                    channel_range: scale[0],
                    max_adc: i16::from_le_bytes([scale[1], scale[2]]),
                }
            }
            tag => {
                return Err(Error::MalformedHeader(format!(
                    "unknown sample type {:?}, expected 'f', 'd' or 's'",
                    tag as char
                )));
            }
        };

        let mut plaintext_len = [0u8; 1];
        read_header_bytes(reader, &mut plaintext_len)?;

        let mut key = [0u8; KEY_LEN];
        read_header_bytes(reader, &mut key)?;

        Ok(Self {
            num_traces,
            num_samples,
            sample_type,
            plaintext_len: plaintext_len[0],
            key,
        })
    }

    /// Serializes the header at the current position of `writer`.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        writer.write_all(&self.num_traces.to_le_bytes())?;
        writer.write_all(&self.num_samples.to_le_bytes())?;
        writer.write_all(&[self.sample_type.tag()])?;
        if let SampleType::Int16 {
            channel_range,
            max_adc,
        } = self.sample_type
        {
            writer.write_all(&[channel_range])?;
            writer.write_all(&max_adc.to_le_bytes())?;
        }
        writer.write_all(&[self.plaintext_len])?;
        writer.write_all(&self.key)?;

        Ok(())
    }

    /// Returns the header length in bytes.
    pub fn size(&self) -> usize {
        match self.sample_type {
            SampleType::Int16 { .. } => HEAD_SIZE_SCALED,
            _ => HEAD_SIZE,
        }
    }

    /// Returns the length in bytes of the leakage part of a row.
    pub fn leakage_len(&self) -> usize {
        self.num_samples as usize * self.sample_type.width()
    }

    /// Returns the length in bytes of a row.
    pub fn row_len(&self) -> usize {
        self.plaintext_len as usize + self.leakage_len()
    }

    /// Returns the byte offset of the row `index` in the file.
    pub fn row_offset(&self, index: usize) -> u64 {
        (self.size() + index * self.row_len()) as u64
    }

    /// Returns `true` if the header carries the scale needed for millivolt conversion.
    pub fn has_scale(&self) -> bool {
        self.size() == HEAD_SIZE_SCALED
    }

    /// Returns the factor converting raw samples of this file to millivolts.
    pub fn mv_factor(&self) -> Result<f64, Error> {
        match self.sample_type {
            SampleType::Int16 {
                channel_range,
                max_adc,
            } => adc_to_mv(1., channel_range, max_adc),
            _ => Err(Error::InsufficientHeaderInfo),
        }
    }
}

/// Converts a raw ADC code to millivolts, given the channel range code and the max ADC value
/// of the acquisition.
pub fn adc_to_mv(raw: f64, channel_range: u8, max_adc: i16) -> Result<f64, Error> {
    let range = CHANNEL_RANGES_MV
        .get(channel_range as usize)
        .ok_or_else(|| {
            Error::MalformedHeader(format!("unknown channel range code {channel_range}"))
        })?;
    if max_adc == 0 {
        return Err(Error::MalformedHeader("max ADC value is 0".to_string()));
    }

    Ok(raw * range / max_adc as f64)
}

fn read_header_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::MalformedHeader("truncated header".to_string()),
        _ => Error::IoError(e),
    })
}

#[cfg(test)]
mod tests {
    use super::{SampleType, TraceHeader, adc_to_mv};
    use crate::Error;

    fn scaled_header() -> TraceHeader {
        TraceHeader {
            num_traces: 3,
            num_samples: 5,
            sample_type: SampleType::Int16 {
                channel_range: 6,
                max_adc: 32512,
            },
            plaintext_len: 16,
            key: [0x2b; 16],
        }
    }

    #[test]
    fn test_header_layout() {
        let header = scaled_header();
        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();

        assert_eq!(bytes.len(), 29);
        assert_eq!(&bytes[0..4], &[3, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[5, 0, 0, 0]);
        assert_eq!(bytes[8], b's');
        assert_eq!(bytes[9], 6);
        assert_eq!(&bytes[10..12], &32512i16.to_le_bytes());
        assert_eq!(bytes[12], 16);
        assert_eq!(&bytes[13..29], &[0x2b; 16]);

        assert_eq!(TraceHeader::read(&mut bytes.as_slice()).unwrap(), header);
        assert_eq!(header.row_len(), 16 + 5 * 2);
        assert_eq!(header.row_offset(2), 29 + 2 * 26);
    }

    #[test]
    fn test_float_header_size() {
        let header = TraceHeader {
            sample_type: SampleType::Float32,
            ..scaled_header()
        };
        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();

        assert_eq!(bytes.len(), 26);
        assert_eq!(header.size(), 26);
        assert_eq!(bytes[9], 16);
        assert!(!header.has_scale());
        assert!(matches!(
            header.mv_factor(),
            Err(Error::InsufficientHeaderInfo)
        ));
    }

    #[test]
    fn test_unknown_tag() {
        let mut bytes = vec![0u8; 26];
        bytes[8] = b'x';

        assert!(matches!(
            TraceHeader::read(&mut bytes.as_slice()),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = [1u8, 0, 0, 0, 4, 0, 0, 0, b'd', 16, 0, 0];

        assert!(matches!(
            TraceHeader::read(&mut bytes.as_slice()),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_adc_to_mv() {
        assert_eq!(adc_to_mv(16256., 6, 32512).unwrap(), 500.);
        assert_eq!(adc_to_mv(-32512., 3, 32512).unwrap(), -100.);
        assert!(adc_to_mv(1., 14, 32512).is_err());
    }
}
