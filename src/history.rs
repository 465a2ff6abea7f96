use std::collections::VecDeque;

/// Bounded output history measured in characters.
///
/// Output is kept as the chunks the PTY produced, each with its character
/// count. Eviction advances an offset into the front chunk instead of
/// rewriting it, so a push costs time proportional to the pushed data.
#[derive(Debug)]
pub struct History {
    chunks: VecDeque<Chunk>,
    /// Byte offset of the first retained character in the front chunk.
    front_start: usize,
    total_chars: usize,
    limit: usize,
}

#[derive(Debug)]
struct Chunk {
    text: String,
    /// Characters retained, i.e. those past `front_start` for the front chunk.
    chars: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            front_start: 0,
            total_chars: 0,
            limit,
        }
    }

    pub fn push(&mut self, data: &str) {
        if data.is_empty() || self.limit == 0 {
            return;
        }

        let chars = data.chars().count();
        if chars >= self.limit {
            // The new chunk alone fills the buffer.
            let start = byte_offset_of_char(data, chars - self.limit);
            self.chunks.clear();
            self.chunks.push_back(Chunk {
                text: data[start..].to_string(),
                chars: self.limit,
            });
            self.front_start = 0;
            self.total_chars = self.limit;
            return;
        }

        self.chunks.push_back(Chunk {
            text: data.to_string(),
            chars,
        });
        self.total_chars += chars;

        while self.total_chars > self.limit {
            let excess = self.total_chars - self.limit;
            let Some(front) = self.chunks.front_mut() else {
                self.total_chars = 0;
                break;
            };
            if front.chars <= excess {
                self.total_chars -= front.chars;
                self.chunks.pop_front();
                self.front_start = 0;
                continue;
            }

            self.front_start += byte_offset_of_char(&front.text[self.front_start..], excess);
            front.chars -= excess;
            self.total_chars -= excess;
            if self.front_start > front.text.len() / 2 {
                front.text.drain(..self.front_start);
                self.front_start = 0;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_chars == 0
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.total_chars
    }

    pub fn snapshot(&self) -> String {
        let bytes = self.chunks.iter().map(|c| c.text.len()).sum::<usize>() - self.front_start;
        let mut out = String::with_capacity(bytes);
        for (i, chunk) in self.chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(&chunk.text[self.front_start..]);
            } else {
                out.push_str(&chunk.text);
            }
        }
        out
    }
}

/// Byte offset of the `char_index`th character; walks only that many characters.
fn byte_offset_of_char(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(offset, _)| offset)
        .unwrap_or(s.len())
}
