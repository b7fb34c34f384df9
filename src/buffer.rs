use crate::Error;
use bytes::BytesMut;

/// Appends `incoming` to the residual `buffer`, growing it in `step`-sized increments.
///
/// The buffer never holds more than `max_size` bytes: data that would push it past the limit
/// is rejected with [`Error::BufferOverflow`] and the buffer is left untouched. When the
/// rounded-up allocation would overshoot `max_size`, the exact size is allocated instead.
pub fn append(
    buffer: &mut BytesMut,
    incoming: &[u8],
    max_size: usize,
    step: usize,
) -> Result<(), Error> {
    let new_len = buffer.len() + incoming.len();
    if new_len > max_size {
        return Err(Error::BufferOverflow {
            size: new_len,
            max: max_size,
        });
    }

    if buffer.capacity() < new_len {
        let rounded = round_up(new_len, step);
        let capacity = if rounded > max_size { new_len } else { rounded };
        let mut grown = BytesMut::with_capacity(capacity);
        grown.extend_from_slice(buffer);
        *buffer = grown;
    }

    buffer.extend_from_slice(incoming);
    Ok(())
}

fn round_up(len: usize, step: usize) -> usize {
    if step == 0 || len % step == 0 {
        len
    } else {
        (len / step + 1) * step
    }
}
