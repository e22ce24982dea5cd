//! Script number encoding: little-endian sign-magnitude, at most four bytes as operands.

use crate::interpreter::ScriptError;

pub const DEFAULT_MAX_NUM_SIZE: usize = 4;

pub fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

pub fn is_minimally_encoded(data: &[u8]) -> bool {
    match data.last() {
        None => true,
        Some(last) if last & 0x7f != 0 => true,
        Some(_) => data.len() > 1 && data[data.len() - 2] & 0x80 != 0,
    }
}

pub fn parse_script_num(
    data: &[u8],
    require_minimal: bool,
    max_size: usize,
) -> Result<i64, ScriptError> {
    if data.len() > max_size {
        return Err(ScriptError::NumOverflow);
    }
    if require_minimal && !is_minimally_encoded(data) {
        return Err(ScriptError::MinimalData);
    }
    let Some(&last) = data.last() else {
        return Ok(0);
    };
    let mut value: i64 = 0;
    for (index, byte) in data.iter().enumerate() {
        value |= (*byte as i64) << (8 * index);
    }
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (data.len() - 1)));
        Ok(-(value & mask))
    } else {
        Ok(value)
    }
}

/// Script truthiness: any non-zero byte, except a lone sign bit on the last byte.
pub fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_sign_magnitude() {
        assert_eq!(script_num_to_vec(0), Vec::<u8>::new());
        assert_eq!(script_num_to_vec(1), vec![0x01]);
        assert_eq!(script_num_to_vec(-1), vec![0x81]);
        assert_eq!(script_num_to_vec(127), vec![0x7f]);
        assert_eq!(script_num_to_vec(128), vec![0x80, 0x00]);
        assert_eq!(script_num_to_vec(-128), vec![0x80, 0x80]);
        assert_eq!(script_num_to_vec(255), vec![0xff, 0x00]);
        assert_eq!(script_num_to_vec(256), vec![0x00, 0x01]);
        assert_eq!(script_num_to_vec(-32768), vec![0x00, 0x80, 0x80]);
    }

    #[test]
    fn decodes_and_enforces_limits() {
        for value in [-2_147_483_647i64, -256, -1, 0, 1, 127, 128, 32767, 2_147_483_647] {
            let bytes = script_num_to_vec(value);
            assert_eq!(parse_script_num(&bytes, true, 4), Ok(value));
        }
        assert_eq!(
            parse_script_num(&[0, 0, 0, 0, 1], false, 4),
            Err(ScriptError::NumOverflow)
        );
        assert_eq!(parse_script_num(&[0, 0, 0, 0, 1], false, 5), Ok(1 << 32));
        assert_eq!(
            parse_script_num(&[0x01, 0x00], true, 4),
            Err(ScriptError::MinimalData)
        );
        assert_eq!(parse_script_num(&[0x01, 0x00], false, 4), Ok(1));
        assert_eq!(parse_script_num(&[0x80], false, 4), Ok(0));
        assert!(is_minimally_encoded(&[0x80, 0x00]));
        assert!(!is_minimally_encoded(&[0x00]));
    }

    #[test]
    fn truthiness() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0x00, 0x00]));
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x80, 0x00]));
        assert!(cast_to_bool(&[0x01]));
    }
}
