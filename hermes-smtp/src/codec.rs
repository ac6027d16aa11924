//! DATA transparency (RFC 5321 §4.5.2).
//!
//! A sender prefixes every line that begins with `.` with one more `.`, a
//! receiver strips exactly one leading `.` from every line. Line starts are
//! the first byte of the content and every byte following a `\r\n`; neither
//! transformation adds or removes line breaks, so the two are exact inverses
//! for any input.

/// Terminates the content of a DATA command.
pub const END_OF_DATA: &[u8] = b".\r\n";

/// Double every `.` that starts a line.
#[must_use]
pub fn dot_stuff(content: &[u8]) -> Vec<u8> {
    let extra = line_starts(content).filter(|&i| content[i] == b'.').count();
    let mut out = Vec::with_capacity(content.len() + extra);

    let mut last = 0;
    for start in line_starts(content).filter(|&i| content[i] == b'.') {
        out.extend_from_slice(&content[last..start]);
        out.push(b'.');
        last = start;
    }
    out.extend_from_slice(&content[last..]);

    out
}

/// Remove one `.` from every line that starts with one.
#[must_use]
pub fn dot_unstuff(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len());

    let mut last = 0;
    for start in line_starts(content).filter(|&i| content[i] == b'.') {
        out.extend_from_slice(&content[last..start]);
        last = start + 1;
    }
    out.extend_from_slice(&content[last..]);

    out
}

/// Unstuff a single line as read off the wire during DATA.
///
/// Returns `None` for the terminating `.` line.
#[must_use]
pub fn unstuff_line(line: &[u8]) -> Option<&[u8]> {
    if line == END_OF_DATA || line == b".\n" {
        return None;
    }

    Some(line.strip_prefix(b".").unwrap_or(line))
}

/// The bytes a client writes after a `354` reply: stuffed content, a
/// trailing line break if the content lacks one, and the terminator.
#[must_use]
pub fn data_payload(content: &[u8]) -> Vec<u8> {
    let mut payload = dot_stuff(content);

    if !payload.is_empty() && !payload.ends_with(b"\r\n") {
        payload.extend_from_slice(b"\r\n");
    }
    payload.extend_from_slice(END_OF_DATA);

    payload
}

fn line_starts(content: &[u8]) -> impl Iterator<Item = usize> + '_ {
    let first = (!content.is_empty()).then_some(0);

    first.into_iter().chain(
        content
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w == b"\r\n")
            .map(|(i, _)| i + 2)
            .filter(|&i| i < content.len()),
    )
}
