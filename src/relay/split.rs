/// Length of `text` as Telegram counts it: UTF-16 code units.
pub fn telegram_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Byte index at which the first message-sized chunk of `text` ends.
///
/// The chunk holds at most `max_units` UTF-16 code units (at least one
/// character). It ends just after the last newline of the window when that
/// newline sits in the back half of the window, otherwise at the hard limit.
pub fn chunk_end(text: &str, max_units: usize) -> usize {
    let max_units = max_units.max(1);
    let mut units = 0;
    let mut back_half_start = 0;
    let mut hard_limit = None;
    for (index, ch) in text.char_indices() {
        if units <= max_units / 2 {
            back_half_start = index;
        }
        units += ch.len_utf16();
        if units > max_units {
            hard_limit = Some(if index == 0 { ch.len_utf8() } else { index });
            break;
        }
    }
    let Some(hard_limit) = hard_limit else {
        return text.len();
    };

    match text[..hard_limit].rfind('\n') {
        Some(newline) if newline >= back_half_start => newline + 1,
        _ => hard_limit,
    }
}

/// Splits `text` into consecutive chunks of at most `max_units` UTF-16 code
/// units. Concatenating the chunks gives back `text` unchanged.
pub fn split_message(text: &str, max_units: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let end = chunk_end(rest, max_units);
        chunks.push(&rest[..end]);
        rest = &rest[end..];
    }
    chunks
}
