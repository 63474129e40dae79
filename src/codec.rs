//! Binary wire formats exchanged with trackers and the simulator.
//!
//! All multi-byte fields are little-endian.
//!
//! ```text
//! Skeleton record (32 bytes, repeated per rigid body)
//! Offset  Size  Field
//! 0       4     i32 rigid body id (lower 8 bits significant)
//! 4       12    f32 x3 position
//! 16      16    f32 x4 quaternion (wire order configurable)
//!
//! IMU record (104 bytes minimum, repeated per device)
//! 0       8     i64 timestamp
//! 8       8     i64 reserved
//! 16      8     ASCII device name
//! 24      24    f64 x3 unused
//! 48      24    f64 x3 Euler angles
//! 72      32    f64 x4 quaternion (wire order configurable)
//!
//! Command frame: 10 x f32. Flag frame: 1 ASCII byte.
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};

use crate::command::{CommandVector, COMMAND_LEN};
use crate::error::PipelineError;

pub const SKELETON_RECORD_SIZE: usize = 32;
pub const IMU_RECORD_MIN_SIZE: usize = 104;
pub const IMU_SINGLE_SIZE: usize = 4 * 8;
pub const REMOTE_VALUES: usize = 4;
pub const REMOTE_SIZE: usize = REMOTE_VALUES * 4;
pub const COMMAND_SIZE: usize = COMMAND_LEN * 4;

/// Logical stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Skeleton,
    ImuArray,
    ImuSingle,
    Remote,
    Calibration,
    Flag,
}

/// A received datagram, or the sentinel for a read that timed out
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Timeout,
    Data { modality: Modality, bytes: Vec<u8> },
}

impl Frame {
    pub fn new(modality: Modality, bytes: Vec<u8>) -> Self {
        Frame::Data { modality, bytes }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Frame::Timeout)
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Timeout => None,
            Frame::Data { bytes, .. } => Some(bytes),
        }
    }
}

/// Outcome of decoding one frame. Timeouts and bad sizes are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Timeout,
    SizeMismatch { expected: usize, got: usize },
    Malformed(String),
    Ok(T),
}

impl<T> Decoded<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        match self {
            Decoded::Timeout => Decoded::Timeout,
            Decoded::SizeMismatch { expected, got } => Decoded::SizeMismatch { expected, got },
            Decoded::Malformed(reason) => Decoded::Malformed(reason),
            Decoded::Ok(v) => Decoded::Ok(f(v)),
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Decoded::Ok(v) => Some(v),
            _ => None,
        }
    }
}

/// One tracked joint. Orientation is stored as [x, y, z, w].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JointSample {
    pub id: u8,
    pub position: [f32; 3],
    pub orientation: [f32; 4],
}

impl JointSample {
    pub fn identity(id: u8) -> Self {
        Self {
            id,
            position: [0.0; 3],
            orientation: [0.0, 0.0, 0.0, 1.0],
        }
    }

    /// Numeric row as recorded to disk: id, position, quaternion
    pub fn to_row(&self) -> [f64; 8] {
        let mut row = [0.0f64; 8];
        row[0] = self.id as f64;
        for i in 0..3 {
            row[1 + i] = self.position[i] as f64;
        }
        for i in 0..4 {
            row[4 + i] = self.orientation[i] as f64;
        }
        row
    }
}

/// One decoded IMU record
#[derive(Debug, Clone, PartialEq)]
pub struct ImuSample {
    pub timestamp: i64,
    pub id: u8,
    pub euler: [f32; 3],
    pub orientation: [f32; 4],
}

impl ImuSample {
    /// IMUs carry no position; the joint sits at the origin
    pub fn joint(&self) -> JointSample {
        JointSample {
            id: self.id,
            position: [0.0; 3],
            orientation: self.orientation,
        }
    }

    /// Numeric row as recorded to disk: id, Euler angles, quaternion
    pub fn to_row(&self) -> [f64; 8] {
        let mut row = [0.0f64; 8];
        row[0] = self.id as f64;
        for i in 0..3 {
            row[1 + i] = self.euler[i] as f64;
        }
        for i in 0..4 {
            row[4 + i] = self.orientation[i] as f64;
        }
        row
    }
}

fn reorder_from_wire<T: Copy>(wire: [T; 4], order: &[usize; 4]) -> [T; 4] {
    [wire[order[0]], wire[order[1]], wire[order[2]], wire[order[3]]]
}

fn reorder_to_wire<T: Copy + Default>(canonical: [T; 4], order: &[usize; 4]) -> [T; 4] {
    let mut wire = [T::default(); 4];
    for (i, &pos) in order.iter().enumerate() {
        wire[pos] = canonical[i];
    }
    wire
}

fn sort_and_check_ids<T>(items: &mut [T], id: impl Fn(&T) -> u8) -> Result<(), String> {
    items.sort_by_key(|item| id(item));
    for pair in items.windows(2) {
        if id(&pair[0]) == id(&pair[1]) {
            return Err(format!("duplicate joint id {}", id(&pair[0])));
        }
    }
    Ok(())
}

fn read_skeleton_record(cursor: &mut Cursor<&[u8]>, order: &[usize; 4]) -> io::Result<JointSample> {
    let raw_id = cursor.read_i32::<LittleEndian>()?;
    let mut position = [0.0f32; 3];
    for p in position.iter_mut() {
        *p = cursor.read_f32::<LittleEndian>()?;
    }
    let mut wire = [0.0f32; 4];
    for q in wire.iter_mut() {
        *q = cursor.read_f32::<LittleEndian>()?;
    }
    Ok(JointSample {
        id: (raw_id as u32 & 0xFF) as u8,
        position,
        orientation: reorder_from_wire(wire, order),
    })
}

/// Decode a skeleton frame of exactly `n_bodies` rigid bodies, sorted by id
pub fn decode_skeleton(bytes: &[u8], n_bodies: usize, order: &[usize; 4]) -> Decoded<Vec<JointSample>> {
    let expected = n_bodies * SKELETON_RECORD_SIZE;
    if bytes.len() != expected {
        return Decoded::SizeMismatch {
            expected,
            got: bytes.len(),
        };
    }

    let mut cursor = Cursor::new(bytes);
    let mut joints = Vec::with_capacity(n_bodies);
    for _ in 0..n_bodies {
        match read_skeleton_record(&mut cursor, order) {
            Ok(joint) => joints.push(joint),
            Err(e) => return Decoded::Malformed(format!("skeleton record: {e}")),
        }
    }

    match sort_and_check_ids(&mut joints, |j| j.id) {
        Ok(()) => Decoded::Ok(joints),
        Err(reason) => Decoded::Malformed(reason),
    }
}

pub fn encode_skeleton(joints: &[JointSample], order: &[usize; 4]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(joints.len() * SKELETON_RECORD_SIZE);
    for joint in joints {
        // Vec<u8> writes cannot fail
        let _ = buf.write_i32::<LittleEndian>(joint.id as i32);
        for p in joint.position {
            let _ = buf.write_f32::<LittleEndian>(p);
        }
        for q in reorder_to_wire(joint.orientation, order) {
            let _ = buf.write_f32::<LittleEndian>(q);
        }
    }
    buf
}

/// Layout parameters for IMU-array frames
#[derive(Debug, Clone)]
pub struct ImuArrayLayout<'a> {
    pub record_size: usize,
    pub order: &'a [usize; 4],
    /// Lower-cased device name -> joint id
    pub ids: &'a BTreeMap<String, u8>,
}

fn read_imu_record(record: &[u8], layout: &ImuArrayLayout<'_>) -> Result<ImuSample, String> {
    let mut cursor = Cursor::new(record);
    let io_err = |e: io::Error| format!("imu record: {e}");

    let timestamp = cursor.read_i64::<LittleEndian>().map_err(io_err)?;
    let _reserved = cursor.read_i64::<LittleEndian>().map_err(io_err)?;
    let mut name = [0u8; 8];
    cursor.read_exact(&mut name).map_err(io_err)?;
    let mut values = [0.0f64; 10];
    for v in values.iter_mut() {
        *v = cursor.read_f64::<LittleEndian>().map_err(io_err)?;
    }

    let device = String::from_utf8_lossy(&name)
        .trim_end_matches('\0')
        .to_lowercase();
    let id = *layout
        .ids
        .get(&device)
        .ok_or_else(|| format!("unknown imu device `{device}`"))?;

    let wire = [values[6] as f32, values[7] as f32, values[8] as f32, values[9] as f32];
    Ok(ImuSample {
        timestamp,
        id,
        euler: [values[3] as f32, values[4] as f32, values[5] as f32],
        orientation: reorder_from_wire(wire, layout.order),
    })
}

/// Decode an IMU-array frame; record count = length / record size
pub fn decode_imu_array(bytes: &[u8], layout: &ImuArrayLayout<'_>) -> Decoded<Vec<ImuSample>> {
    let n_records = bytes.len() / layout.record_size;
    if n_records == 0 || bytes.len() % layout.record_size != 0 {
        return Decoded::SizeMismatch {
            expected: n_records.max(1) * layout.record_size,
            got: bytes.len(),
        };
    }

    let mut samples = Vec::with_capacity(n_records);
    for record in bytes.chunks_exact(layout.record_size) {
        match read_imu_record(record, layout) {
            Ok(sample) => samples.push(sample),
            Err(reason) => return Decoded::Malformed(reason),
        }
    }

    match sort_and_check_ids(&mut samples, |s| s.id) {
        Ok(()) => Decoded::Ok(samples),
        Err(reason) => Decoded::Malformed(reason),
    }
}

/// Encode one IMU record, padded to `record_size`
pub fn encode_imu_record(
    device: &str,
    timestamp: i64,
    euler: [f64; 3],
    orientation: [f64; 4],
    order: &[usize; 4],
    record_size: usize,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record_size);
    let _ = buf.write_i64::<LittleEndian>(timestamp);
    let _ = buf.write_i64::<LittleEndian>(0);
    let mut name = [0u8; 8];
    for (dst, src) in name.iter_mut().zip(device.bytes()) {
        *dst = src;
    }
    buf.extend_from_slice(&name);
    for _ in 0..3 {
        let _ = buf.write_f64::<LittleEndian>(0.0);
    }
    for e in euler {
        let _ = buf.write_f64::<LittleEndian>(e);
    }
    for q in reorder_to_wire(orientation, order) {
        let _ = buf.write_f64::<LittleEndian>(q);
    }
    buf.resize(record_size.max(IMU_RECORD_MIN_SIZE), 0);
    buf
}

/// Single IMU frame: [timestamp, roll, pitch, yaw] as f64, angles returned
pub fn decode_imu_single(bytes: &[u8]) -> Decoded<[f64; 3]> {
    if bytes.len() != IMU_SINGLE_SIZE {
        return Decoded::SizeMismatch {
            expected: IMU_SINGLE_SIZE,
            got: bytes.len(),
        };
    }
    let mut cursor = Cursor::new(bytes);
    let mut values = [0.0f64; 4];
    for v in values.iter_mut() {
        match cursor.read_f64::<LittleEndian>() {
            Ok(x) => *v = x,
            Err(e) => return Decoded::Malformed(format!("imu frame: {e}")),
        }
    }
    Decoded::Ok([values[1], values[2], values[3]])
}

/// Fixed-count f32 vector (remote, simulator calibration)
pub fn decode_f32_vec(bytes: &[u8], count: usize) -> Decoded<Vec<f32>> {
    let expected = count * 4;
    if bytes.len() != expected {
        return Decoded::SizeMismatch {
            expected,
            got: bytes.len(),
        };
    }
    let mut cursor = Cursor::new(bytes);
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        match cursor.read_f32::<LittleEndian>() {
            Ok(x) => values.push(x),
            Err(e) => return Decoded::Malformed(format!("float vector: {e}")),
        }
    }
    Decoded::Ok(values)
}

pub fn encode_f32_vec(values: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for &v in values {
        let _ = buf.write_f32::<LittleEndian>(v);
    }
    buf
}

pub fn encode_command(command: &CommandVector) -> Vec<u8> {
    encode_f32_vec(command.as_slice())
}

pub fn decode_command(bytes: &[u8]) -> Decoded<CommandVector> {
    decode_f32_vec(bytes, COMMAND_LEN).map(|values| {
        let mut data = [0.0f32; COMMAND_LEN];
        data.copy_from_slice(&values);
        CommandVector::from_array(data)
    })
}

/// Skeleton forwarded to the avatar: per joint `i32 id + f32 x7`, then an f32 frame counter
pub fn encode_avatar(joints: &[JointSample], counter: u64) -> Vec<u8> {
    let mut buf = encode_skeleton(joints, &[0, 1, 2, 3]);
    let _ = buf.write_f32::<LittleEndian>(counter as f32);
    buf
}

/// Single-byte handshake flag sent by the simulator each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFlag {
    /// Ready: acquire this frame
    Acquire,
    /// Ready: control this frame
    Control,
    /// End the session
    Quit,
    /// Avatar render request
    Render,
}

impl HandshakeFlag {
    const TABLE: [(u8, HandshakeFlag); 4] = [
        (b'a', HandshakeFlag::Acquire),
        (b'c', HandshakeFlag::Control),
        (b'q', HandshakeFlag::Quit),
        (b'r', HandshakeFlag::Render),
    ];

    pub fn from_byte(byte: u8) -> Result<Self, PipelineError> {
        Self::TABLE
            .iter()
            .find(|(b, _)| *b == byte)
            .map(|(_, flag)| *flag)
            .ok_or(PipelineError::UnknownFlag(byte))
    }

    pub fn as_byte(&self) -> u8 {
        Self::TABLE
            .iter()
            .find(|(_, flag)| flag == self)
            .map(|(b, _)| *b)
            .unwrap_or(b'q')
    }
}

/// Decode a flag frame. A timeout means "no flag this tick".
pub fn decode_flag(frame: &Frame) -> Result<Option<HandshakeFlag>, PipelineError> {
    match frame.bytes() {
        None => Ok(None),
        Some([byte]) => HandshakeFlag::from_byte(*byte).map(Some),
        Some([]) => Ok(None),
        Some(bytes) => Err(PipelineError::UnknownFlag(bytes[0])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joint(id: u8, q: [f32; 4]) -> JointSample {
        JointSample {
            id,
            position: [id as f32, 0.5, -1.0],
            orientation: q,
        }
    }

    #[test]
    fn test_skeleton_sorted_by_id() {
        let order = [0, 1, 2, 3];
        let joints = vec![
            joint(3, [0.0, 0.0, 0.0, 1.0]),
            joint(1, [0.0, 0.0, 0.0, 1.0]),
            joint(2, [0.0, 0.0, 0.0, 1.0]),
        ];
        let bytes = encode_skeleton(&joints, &order);
        let decoded = decode_skeleton(&bytes, 3, &order).ok().unwrap();

        let ids: Vec<u8> = decoded.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(decoded[0].position, [1.0, 0.5, -1.0]);

        let reencoded = encode_skeleton(&decoded, &order);
        let again = decode_skeleton(&reencoded, 3, &order).ok().unwrap();
        assert_eq!(again, decoded);
    }

    #[test]
    fn test_skeleton_id_uses_low_byte() {
        let mut bytes = encode_skeleton(&[joint(7, [0.0, 0.0, 0.0, 1.0])], &[0, 1, 2, 3]);
        bytes[..4].copy_from_slice(&(0x0102_0307i32).to_le_bytes());
        let decoded = decode_skeleton(&bytes, 1, &[0, 1, 2, 3]).ok().unwrap();
        assert_eq!(decoded[0].id, 7);
    }

    #[test]
    fn test_skeleton_short_buffer_is_size_mismatch() {
        let bytes = encode_skeleton(&[joint(1, [0.0, 0.0, 0.0, 1.0])], &[0, 1, 2, 3]);
        let short = &bytes[..bytes.len() - 3];
        assert_eq!(
            decode_skeleton(short, 1, &[0, 1, 2, 3]),
            Decoded::SizeMismatch {
                expected: 32,
                got: 29
            }
        );
    }

    #[test]
    fn test_skeleton_duplicate_ids_rejected() {
        let joints = vec![joint(2, [0.0, 0.0, 0.0, 1.0]), joint(2, [0.0, 0.0, 0.0, 1.0])];
        let bytes = encode_skeleton(&joints, &[0, 1, 2, 3]);
        assert!(matches!(
            decode_skeleton(&bytes, 2, &[0, 1, 2, 3]),
            Decoded::Malformed(_)
        ));
    }

    #[test]
    fn test_quaternion_order_applied() {
        // wire is [w, x, y, z]; canonical x comes from wire slot 1
        let order = [1, 2, 3, 0];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        for v in [0.0f32, 0.0, 0.0, 0.9, 0.1, 0.2, 0.3] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let decoded = decode_skeleton(&bytes, 1, &order).ok().unwrap();
        assert_eq!(decoded[0].orientation, [0.1, 0.2, 0.3, 0.9]);

        let wire = encode_skeleton(&decoded, &order);
        assert_eq!(wire, bytes);
    }

    #[test]
    fn test_imu_array_maps_names_case_insensitive() {
        let mut ids = BTreeMap::new();
        ids.insert("imu_back".to_string(), 1u8);
        ids.insert("imu_arm".to_string(), 2u8);
        let order = [0, 1, 2, 3];
        let layout = ImuArrayLayout {
            record_size: 104,
            order: &order,
            ids: &ids,
        };

        let mut bytes = encode_imu_record("IMU_ARM", 20, [1.0, 2.0, 3.0], [0.0, 0.0, 0.0, 1.0], &order, 104);
        bytes.extend(encode_imu_record("Imu_Back", 10, [4.0, 5.0, 6.0], [0.0, 0.0, 0.0, 1.0], &order, 104));

        let samples = decode_imu_array(&bytes, &layout).ok().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].id, 1);
        assert_eq!(samples[0].euler, [4.0, 5.0, 6.0]);
        assert_eq!(samples[0].timestamp, 10);
        assert_eq!(samples[1].id, 2);
    }

    #[test]
    fn test_imu_array_unknown_device_is_malformed() {
        let ids = BTreeMap::new();
        let order = [0, 1, 2, 3];
        let layout = ImuArrayLayout {
            record_size: 104,
            order: &order,
            ids: &ids,
        };
        let bytes = encode_imu_record("ghost", 0, [0.0; 3], [0.0, 0.0, 0.0, 1.0], &order, 104);
        assert!(matches!(decode_imu_array(&bytes, &layout), Decoded::Malformed(_)));
    }

    #[test]
    fn test_imu_array_count_follows_length() {
        let mut ids = BTreeMap::new();
        for i in 0..3u8 {
            ids.insert(format!("imu{i}"), i + 1);
        }
        let order = [0, 1, 2, 3];
        let layout = ImuArrayLayout {
            record_size: 112,
            order: &order,
            ids: &ids,
        };
        let record = |name: &str| encode_imu_record(name, 0, [0.0; 3], [0.0, 0.0, 0.0, 1.0], &order, 112);

        let mut bytes = record("imu2");
        bytes.extend(record("imu0"));
        bytes.extend(record("imu1"));
        let samples = decode_imu_array(&bytes, &layout).ok().unwrap();
        assert_eq!(samples.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        assert_eq!(
            decode_imu_array(&bytes[..200], &layout),
            Decoded::SizeMismatch {
                expected: 112,
                got: 200
            }
        );
        assert!(matches!(
            decode_imu_array(&[], &layout),
            Decoded::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_imu_single_skips_timestamp() {
        let mut bytes = Vec::new();
        for v in [123.0f64, 10.0, 20.0, 30.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(decode_imu_single(&bytes), Decoded::Ok([10.0, 20.0, 30.0]));
        assert!(matches!(
            decode_imu_single(&bytes[..16]),
            Decoded::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_command_frame_is_forty_bytes() {
        let mut data = [0.0f32; COMMAND_LEN];
        data[0] = 0.5;
        data[1] = -1.0;
        let bytes = encode_command(&CommandVector::from_array(data));
        assert_eq!(bytes.len(), COMMAND_SIZE);
        assert_eq!(&bytes[..4], &0.5f32.to_le_bytes());
        assert_eq!(decode_command(&bytes).ok().unwrap().as_slice()[1], -1.0);
    }

    #[test]
    fn test_flag_table() {
        for (byte, flag) in [
            (b'a', HandshakeFlag::Acquire),
            (b'c', HandshakeFlag::Control),
            (b'q', HandshakeFlag::Quit),
            (b'r', HandshakeFlag::Render),
        ] {
            assert_eq!(HandshakeFlag::from_byte(byte).unwrap(), flag);
            assert_eq!(flag.as_byte(), byte);
        }
        assert!(matches!(
            HandshakeFlag::from_byte(b'x'),
            Err(PipelineError::UnknownFlag(b'x'))
        ));
    }

    #[test]
    fn test_decode_flag_timeout_is_none() {
        assert_eq!(decode_flag(&Frame::Timeout).unwrap(), None);
        assert_eq!(
            decode_flag(&Frame::new(Modality::Flag, vec![b'q'])).unwrap(),
            Some(HandshakeFlag::Quit)
        );
        assert!(decode_flag(&Frame::new(Modality::Flag, vec![b'z'])).is_err());
    }

    #[test]
    fn test_avatar_frame_has_trailing_counter() {
        let bytes = encode_avatar(&[JointSample::identity(1)], 5);
        assert_eq!(bytes.len(), SKELETON_RECORD_SIZE + 4);
        assert_eq!(&bytes[32..], &5.0f32.to_le_bytes());
    }
}
