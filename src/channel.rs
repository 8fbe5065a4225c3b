//! The stimulus channel registry.
//!
//! ITM multiplexes up to 32 logical byte streams over SWO; each stream has
//! a slot here holding its enabled flag, display name and display color.
//! The registry is owned by the trace context and only ever touched from
//! the UI thread (the decoder runs on that same thread), so the accessors
//! are plain reads and writes.

/// Number of ITM stimulus channels.
pub const CHANNEL_COUNT: usize = 32;

/// Longest channel name kept in the registry, in bytes.
const NAME_MAX: usize = 29;

/// An RGBA color with 8 bits per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba::new(255, 255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Rgba {
        Rgba { r, g, b, a }
    }
}

#[derive(Debug, Clone)]
struct Channel {
    enabled: bool,
    name: String,
    color: Rgba,
}

/// Registry of the 32 stimulus channel slots.
///
/// Channel 0 starts out enabled (it is the conventional `printf` channel);
/// all other channels start out disabled. Every slot starts out named
/// after its index and colored white.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        ChannelRegistry::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> ChannelRegistry {
        let channels = (0..CHANNEL_COUNT)
            .map(|index| Channel {
                enabled: index == 0,
                name: index.to_string(),
                color: Rgba::WHITE,
            })
            .collect();

        ChannelRegistry { channels }
    }

    /// Sets every field of a channel slot in one call. A `None` name
    /// renames the channel to its index.
    pub fn set(&mut self, channel: u8, enabled: bool, name: Option<&str>, color: Rgba) {
        self.set_enabled(channel, enabled);
        self.set_name(channel, name);
        self.set_color(channel, color);
    }

    /// Whether the decoder materializes trace for this channel. Channels
    /// outside `0..32` report as disabled.
    pub fn is_enabled(&self, channel: u8) -> bool {
        self.channels
            .get(channel as usize)
            .map(|c| c.enabled)
            .unwrap_or(false)
    }

    pub fn set_enabled(&mut self, channel: u8, enabled: bool) {
        if let Some(c) = self.channels.get_mut(channel as usize) {
            c.enabled = enabled;
        }
    }

    /// The channel's display name. Channels outside `0..32` report an
    /// empty name.
    pub fn name(&self, channel: u8) -> &str {
        self.channels
            .get(channel as usize)
            .map(|c| c.name.as_str())
            .unwrap_or("")
    }

    /// Renames a channel. Names longer than 29 bytes are truncated on a
    /// character boundary; `None` renames the channel to its index.
    pub fn set_name(&mut self, channel: u8, name: Option<&str>) {
        if let Some(c) = self.channels.get_mut(channel as usize) {
            c.name = match name {
                Some(name) => truncated(name, NAME_MAX).to_string(),
                None => channel.to_string(),
            };
        }
    }

    pub fn color(&self, channel: u8) -> Rgba {
        self.channels
            .get(channel as usize)
            .map(|c| c.color)
            .unwrap_or(Rgba::WHITE)
    }

    pub fn set_color(&mut self, channel: u8, color: Rgba) {
        if let Some(c) = self.channels.get_mut(channel as usize) {
            c.color = color;
        }
    }
}

/// Truncates to at most `max` bytes without splitting a UTF-8 sequence.
fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let registry = ChannelRegistry::new();
        assert!(registry.is_enabled(0));
        for channel in 1..CHANNEL_COUNT as u8 {
            assert!(!registry.is_enabled(channel));
        }
        assert_eq!(registry.name(7), "7");
        assert_eq!(registry.color(7), Rgba::WHITE);
    }

    #[test]
    fn out_of_range_is_inert() {
        let mut registry = ChannelRegistry::new();
        registry.set_enabled(32, true);
        assert!(!registry.is_enabled(32));
        assert_eq!(registry.name(200), "");
    }

    #[test]
    fn name_truncation() {
        let mut registry = ChannelRegistry::new();
        registry.set_name(3, Some("0123456789012345678901234567890123"));
        assert_eq!(registry.name(3).len(), 29);

        // multi-byte characters are never split
        registry.set_name(3, Some("äääääääääääääää"));
        assert_eq!(registry.name(3), "ääääääääääääää");
    }

    #[test]
    fn null_name_stringifies_index() {
        let mut registry = ChannelRegistry::new();
        registry.set_name(12, Some("console"));
        assert_eq!(registry.name(12), "console");
        registry.set_name(12, None);
        assert_eq!(registry.name(12), "12");
    }
}
