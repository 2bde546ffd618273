use crate::dtype::{Device, Dtype};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
#[error("random data generation not implemented for dtype {dtype}")]
pub struct UnsupportedDtype {
    pub dtype: Dtype,
}

/// A dense, row-major, little-endian typed buffer.
///
/// This is the in-memory and on-disk (MessagePack) representation of one
/// materialized tensor argument. `data` always holds exactly
/// `shape.product() * dtype.size_of()` bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorBuffer {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub device: Device,
    #[serde(with = "serde_bytes_compat")]
    pub data: Vec<u8>,
}

// rmp-serde encodes Vec<u8> element-wise unless told otherwise; keep blobs
// compact by writing the byte-string form.
mod serde_bytes_compat {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;
        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("byte buffer")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    out.push(byte);
                }
                Ok(out)
            }
        }
        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

impl TensorBuffer {
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.num_elements() * self.dtype.size_of()
    }

    /// Re-tag the buffer with a new logical placement.
    #[must_use]
    pub fn to_device(mut self, device: &Device) -> Self {
        self.device = device.clone();
        self
    }

    /// Synthesize a buffer of the given shape filled with category-appropriate
    /// random values.
    ///
    /// The float8 e4m3 category cannot be filled directly: values are generated
    /// at float32 precision and then down-cast. Unsigned categories wider than
    /// 8 bits use a bounded range instead of a full-width fill.
    pub fn random<R: Rng>(
        dtype: Dtype,
        shape: Vec<usize>,
        device: Device,
        rng: &mut R,
    ) -> Result<Self, UnsupportedDtype> {
        let num_elements: usize = shape.iter().product();
        let mut data = Vec::with_capacity(num_elements * dtype.size_of());
        match dtype {
            Dtype::Float16 => {
                for _ in 0..num_elements {
                    let value = half::f16::from_f32(rng.gen::<f32>());
                    data.extend_from_slice(&value.to_le_bytes());
                }
            }
            Dtype::BFloat16 => {
                for _ in 0..num_elements {
                    let value = half::bf16::from_f32(rng.gen::<f32>());
                    data.extend_from_slice(&value.to_le_bytes());
                }
            }
            Dtype::Float32 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen::<f32>().to_le_bytes());
                }
            }
            Dtype::Float64 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen::<f64>().to_le_bytes());
                }
            }
            // no direct random fill for e4m3: generate wide, cast narrow
            Dtype::Float8E4M3 => {
                for _ in 0..num_elements {
                    data.push(f32_to_f8_e4m3(rng.gen::<f32>()));
                }
            }
            Dtype::Int8 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen::<i8>().to_le_bytes());
                }
            }
            Dtype::Int16 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen::<i16>().to_le_bytes());
                }
            }
            Dtype::Int32 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen::<i32>().to_le_bytes());
                }
            }
            Dtype::Int64 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen::<i64>().to_le_bytes());
                }
            }
            Dtype::UInt8 => {
                for _ in 0..num_elements {
                    data.push(rng.gen::<u8>());
                }
            }
            Dtype::Bool => {
                for _ in 0..num_elements {
                    data.push(u8::from(rng.gen::<bool>()));
                }
            }
            // full-width fill is not available for wide unsigned categories
            Dtype::UInt16 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen_range(0..1000u16).to_le_bytes());
                }
            }
            Dtype::UInt32 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen_range(0..1000u32).to_le_bytes());
                }
            }
            Dtype::UInt64 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen_range(0..1000u64).to_le_bytes());
                }
            }
            // independent real and imaginary parts at the matching precision
            Dtype::Complex64 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen::<f32>().to_le_bytes());
                    data.extend_from_slice(&rng.gen::<f32>().to_le_bytes());
                }
            }
            Dtype::Complex128 => {
                for _ in 0..num_elements {
                    data.extend_from_slice(&rng.gen::<f64>().to_le_bytes());
                    data.extend_from_slice(&rng.gen::<f64>().to_le_bytes());
                }
            }
            Dtype::Float8E5M2 => return Err(UnsupportedDtype { dtype }),
        }
        Ok(Self {
            dtype,
            shape,
            device,
            data,
        })
    }
}

/// A tensor view over a separate storage buffer, described by an explicit
/// layout. Only constructed when the `strided-storage` capability is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StridedTensor {
    pub storage: TensorBuffer,
    pub shape: Vec<usize>,
    pub strides: Vec<i64>,
}

/// Convert a float32 value to the saturating float8 e4m3 format
/// (1 sign, 4 exponent bits biased by 7, 3 mantissa bits, no infinities).
#[must_use]
pub fn f32_to_f8_e4m3(value: f32) -> u8 {
    let bits = value.to_bits();
    let sign = ((bits >> 31) << 7) as u8;
    if value.is_nan() {
        return sign | 0x7f;
    }
    let abs_bits = bits & 0x7fff_ffff;
    let abs = f32::from_bits(abs_bits);
    // largest finite value is 448; everything at or above the rounding
    // boundary saturates
    if abs >= 464.0 {
        return sign | 0x7e;
    }
    let unbiased = ((abs_bits >> 23) as i32) - 127;
    if unbiased >= -6 {
        // normal range
        let exp_field = (unbiased + 7) as u32;
        let mantissa = abs_bits & 0x007f_ffff;
        let mut m = mantissa >> 20;
        let rem = mantissa & 0x000f_ffff;
        // round to nearest, ties to even; a mantissa carry rolls into the
        // exponent field arithmetically
        if rem > 0x0008_0000 || (rem == 0x0008_0000 && (m & 1) == 1) {
            m += 1;
        }
        let mut out = (exp_field << 3) + m;
        if out >= 0x7f {
            out = 0x7e;
        }
        sign | out as u8
    } else {
        // subnormal range: multiples of 2^-9
        let m = (abs * 512.0).round() as u32;
        if m >= 8 {
            // rounded up into the smallest normal
            sign | 0x08
        } else {
            sign | m as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{f32_to_f8_e4m3, TensorBuffer, UnsupportedDtype};
    use crate::dtype::{Device, Dtype};
    use rand::SeedableRng;
    use similar_asserts as diff;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(0)
    }

    #[test]
    fn random_buffer_has_declared_shape_and_size() {
        let buffer = TensorBuffer::random(
            Dtype::Float16,
            vec![4, 8],
            Device::default(),
            &mut rng(),
        )
        .unwrap();
        diff::assert_eq!(have: buffer.num_elements(), want: 32);
        diff::assert_eq!(have: buffer.data.len(), want: 64);
        diff::assert_eq!(have: buffer.shape, want: vec![4, 8]);
    }

    #[test]
    fn complex_buffer_holds_two_components_per_element() {
        let buffer =
            TensorBuffer::random(Dtype::Complex64, vec![3], Device::default(), &mut rng())
                .unwrap();
        diff::assert_eq!(have: buffer.data.len(), want: 3 * 8);
    }

    #[test]
    fn bool_fill_is_zero_or_one() {
        let buffer =
            TensorBuffer::random(Dtype::Bool, vec![64], Device::default(), &mut rng()).unwrap();
        assert!(buffer.data.iter().all(|&b| b <= 1));
    }

    #[test]
    fn wide_unsigned_fill_is_bounded() {
        let buffer =
            TensorBuffer::random(Dtype::UInt32, vec![32], Device::default(), &mut rng()).unwrap();
        for chunk in buffer.data.chunks_exact(4) {
            let value = u32::from_le_bytes(chunk.try_into().unwrap());
            assert!(value < 1000);
        }
    }

    #[test]
    fn unsupported_dtype_is_an_error() {
        let err: UnsupportedDtype =
            TensorBuffer::random(Dtype::Float8E5M2, vec![2], Device::default(), &mut rng())
                .unwrap_err();
        diff::assert_eq!(have: err.dtype, want: Dtype::Float8E5M2);
    }

    #[test]
    fn f8_e4m3_round_trip_points() {
        // 1.0 = 2^0 * 1.0 -> exponent field 7, mantissa 0
        diff::assert_eq!(have: f32_to_f8_e4m3(1.0), want: 0x38);
        // 0.5 -> exponent field 6
        diff::assert_eq!(have: f32_to_f8_e4m3(0.5), want: 0x30);
        // max finite
        diff::assert_eq!(have: f32_to_f8_e4m3(448.0), want: 0x7e);
        // saturation, not infinity
        diff::assert_eq!(have: f32_to_f8_e4m3(1e10), want: 0x7e);
        diff::assert_eq!(have: f32_to_f8_e4m3(-1.75), want: 0x80 | 0x3e);
        diff::assert_eq!(have: f32_to_f8_e4m3(0.0), want: 0x00);
        // smallest subnormal is 2^-9
        diff::assert_eq!(have: f32_to_f8_e4m3(0.001953125), want: 0x01);
    }

    #[test]
    fn buffer_survives_messagepack_round_trip() {
        let buffer =
            TensorBuffer::random(Dtype::Int32, vec![2, 2], Device::from("cuda:0"), &mut rng())
                .unwrap();
        let bytes = rmp_serde::to_vec(&buffer).unwrap();
        let decoded: TensorBuffer = rmp_serde::from_slice(&bytes).unwrap();
        diff::assert_eq!(have: decoded, want: buffer);
    }
}
