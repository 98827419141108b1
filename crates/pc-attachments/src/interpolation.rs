//! Path and URL interpolation
//!
//! Patterns such as `:class/:attachment/:id/:style_:filename` are expanded in
//! a single left-to-right pass. At every `:` the longest registered token that
//! matches wins, so `:id_partition` is never read as `:id` followed by
//! `_partition`. Substituted values are appended verbatim and never scanned
//! again; a filename that itself contains `:id` stays literal.

use std::fmt;
use std::sync::Arc;

use pc_core::Id;

/// Everything a token can be expanded from
#[derive(Debug, Clone, Copy)]
pub struct InterpolationContext<'a> {
    /// Model (class) name, e.g. `BlogPost`
    pub model_name: &'a str,
    /// Attachment field name, e.g. `avatar`
    pub attachment_name: &'a str,
    pub id: Option<Id>,
    pub style: &'a str,
    /// Original (sanitized) filename of the stored file
    pub file_name: Option<&'a str>,
    /// Output format of the style; replaces the original extension
    pub format: Option<&'a str>,
}

impl<'a> InterpolationContext<'a> {
    pub fn basename(&self) -> &'a str {
        let name = self.file_name.unwrap_or_default();
        match extension_index(name) {
            Some(dot) => &name[..dot],
            None => name,
        }
    }

    pub fn extension(&self) -> &'a str {
        if let Some(format) = self.format {
            return format;
        }
        let name = self.file_name.unwrap_or_default();
        match extension_index(name) {
            Some(dot) => &name[dot + 1..],
            None => "",
        }
    }

    pub fn filename(&self) -> String {
        match self.format {
            Some(format) => format!("{}.{}", self.basename(), format),
            None => self.file_name.unwrap_or_default().to_string(),
        }
    }
}

/// Index of the extension dot; a leading dot (`.profile`) is not an extension
fn extension_index(name: &str) -> Option<usize> {
    name.rfind('.').filter(|&dot| dot > 0 && dot + 1 < name.len())
}

pub type InterpolationFn = Arc<dyn Fn(&InterpolationContext<'_>) -> String + Send + Sync>;

/// Token table used to expand path and URL patterns
#[derive(Clone)]
pub struct Interpolator {
    /// Sorted longest token first
    tokens: Vec<(String, InterpolationFn)>,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Interpolator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpolator")
            .field("tokens", &self.tokens().collect::<Vec<_>>())
            .finish()
    }
}

impl Interpolator {
    /// Interpolator with the built-in tokens
    pub fn new() -> Self {
        let mut interpolator = Self { tokens: Vec::new() };
        interpolator.register("class", |ctx| pluralize(&underscore(ctx.model_name)));
        interpolator.register("attachment", |ctx| {
            pluralize(&ctx.attachment_name.to_lowercase())
        });
        interpolator.register("id", |ctx| ctx.id.map(|id| id.to_string()).unwrap_or_default());
        interpolator.register("id_partition", |ctx| {
            ctx.id.map(id_partition).unwrap_or_default()
        });
        interpolator.register("style", |ctx| ctx.style.to_string());
        interpolator.register("basename", |ctx| ctx.basename().to_string());
        interpolator.register("extension", |ctx| ctx.extension().to_string());
        interpolator.register("filename", |ctx| ctx.filename());
        interpolator
    }

    /// Register (or replace) a token. `token` is given without the leading colon.
    pub fn register<F>(&mut self, token: &str, f: F)
    where
        F: Fn(&InterpolationContext<'_>) -> String + Send + Sync + 'static,
    {
        let token = token.trim_start_matches(':').to_string();
        self.tokens.retain(|(existing, _)| *existing != token);
        self.tokens.push((token, Arc::new(f)));
        self.tokens
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    /// Registered tokens, longest first
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(|(token, _)| token.as_str())
    }

    pub fn interpolate(&self, pattern: &str, ctx: &InterpolationContext<'_>) -> String {
        let mut out = String::with_capacity(pattern.len() + 32);
        let mut rest = pattern;

        while let Some(colon) = rest.find(':') {
            out.push_str(&rest[..colon]);
            let after = &rest[colon + 1..];

            match self
                .tokens
                .iter()
                .find(|(token, _)| after.starts_with(token.as_str()))
            {
                Some((token, expand)) => {
                    out.push_str(&expand(ctx));
                    rest = &after[token.len()..];
                }
                None => {
                    out.push(':');
                    rest = after;
                }
            }
        }

        out.push_str(rest);
        out
    }
}

/// `123` -> `000/000/123`
///
/// Ids are zero-padded to at least nine digits and to a multiple of three, so
/// `1234567890` becomes `001/234/567/890`. A negative id gets a leading `-`
/// segment: `-5` -> `-/000/000/005`.
pub fn id_partition(id: Id) -> String {
    let digits = id.unsigned_abs().to_string();
    let width = digits.len().max(9).div_ceil(3) * 3;
    let padded = format!("{:0>width$}", digits, width = width);

    let mut segments: Vec<&str> = Vec::with_capacity(width / 3 + 1);
    if id < 0 {
        segments.push("-");
    }
    segments.extend((0..width).step_by(3).map(|i| &padded[i..i + 3]));
    segments.join("/")
}

/// `BlogPost` -> `blog_post`, `Admin::User` -> `admin/user`
pub fn underscore(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;
    let normalized = name.replace("::", "/");
    let mut chars = normalized.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_uppercase() {
            let after_lower = prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit());
            let acronym_end = prev.is_some_and(|p| p.is_ascii_uppercase())
                && chars.peek().is_some_and(|n| n.is_ascii_lowercase());
            if after_lower || acronym_end {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' {
            out.push('_');
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}

/// Regular English plural of the last path segment
pub fn pluralize(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }
    let lower = word.to_ascii_lowercase();
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{}es", word);
    }
    if let Some(stem) = word.strip_suffix('y') {
        let vowel_before = stem
            .chars()
            .last()
            .is_some_and(|c| "aeiou".contains(c.to_ascii_lowercase()));
        if !vowel_before {
            return format!("{}ies", stem);
        }
    }
    format!("{}s", word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(style: &'a str, file_name: Option<&'a str>) -> InterpolationContext<'a> {
        InterpolationContext {
            model_name: "User",
            attachment_name: "avatar",
            id: Some(42),
            style,
            file_name,
            format: None,
        }
    }

    #[test]
    fn test_default_path_pattern() {
        let i = Interpolator::new();
        assert_eq!(
            i.interpolate(":class/:attachment/:id/:style_:filename", &ctx("thumb", Some("me.png"))),
            "users/avatars/42/thumb_me.png"
        );
        assert_eq!(
            i.interpolate("/:class/:attachment/missing_:style.png", &ctx("original", None)),
            "/users/avatars/missing_original.png"
        );
    }

    #[test]
    fn test_basename_and_extension() {
        let i = Interpolator::new();
        let c = ctx("original", Some("archive.tar.gz"));
        assert_eq!(i.interpolate(":basename|:extension", &c), "archive.tar|gz");

        let hidden = ctx("original", Some(".profile"));
        assert_eq!(i.interpolate(":basename|:extension", &hidden), ".profile|");

        let bare = ctx("original", Some("README"));
        assert_eq!(i.interpolate(":basename.:extension", &bare), "README.");
    }

    #[test]
    fn test_format_overrides_extension() {
        let i = Interpolator::new();
        let c = InterpolationContext {
            format: Some("png"),
            ..ctx("thumb", Some("photo.jpeg"))
        };
        assert_eq!(i.interpolate(":filename :extension", &c), "photo.png png");
    }

    #[test]
    fn test_longest_token_wins() {
        let i = Interpolator::new();
        assert_eq!(
            i.interpolate(":id_partition/:id", &ctx("original", None)),
            "000/000/042/42"
        );
        // tokens are plain prefixes, no word boundary is required
        assert_eq!(
            i.interpolate(":classification", &ctx("original", None)),
            "usersification"
        );
    }

    #[test]
    fn test_unknown_tokens_pass_through() {
        let i = Interpolator::new();
        assert_eq!(
            i.interpolate("http://cdn:8080/:unknown/:style", &ctx("thumb", None)),
            "http://cdn:8080/:unknown/thumb"
        );
        assert_eq!(i.interpolate("trailing:", &ctx("thumb", None)), "trailing:");
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let i = Interpolator::new();
        let c = ctx("original", Some(":id.png"));
        assert_eq!(i.interpolate(":id/:filename", &c), "42/:id.png");
    }

    #[test]
    fn test_idempotent_on_token_free_output() {
        let i = Interpolator::new();
        let c = ctx("thumb", Some("me.png"));
        let once = i.interpolate(":class/:attachment/:id/:style_:filename", &c);
        assert_eq!(i.interpolate(&once, &c), once);
    }

    #[test]
    fn test_custom_token() {
        let mut i = Interpolator::new();
        i.register(":bucket", |c| format!("b{}", c.id.unwrap_or(0) % 4));
        i.register("idx", |_| "custom".to_string());

        assert_eq!(i.interpolate(":bucket/:idx/:id", &ctx("x", None)), "b2/custom/42");
        assert!(i.tokens().any(|t| t == "bucket"));
    }

    #[test]
    fn test_missing_id_expands_empty() {
        let i = Interpolator::new();
        let c = InterpolationContext { id: None, ..ctx("x", None) };
        assert_eq!(i.interpolate("a/:id/:id_partition/b", &c), "a///b");
    }

    #[test]
    fn test_underscore() {
        assert_eq!(underscore("User"), "user");
        assert_eq!(underscore("BlogPost"), "blog_post");
        assert_eq!(underscore("HTMLPage"), "html_page");
        assert_eq!(underscore("Admin::User"), "admin/user");
        assert_eq!(underscore("Photo2Album"), "photo2_album");
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("user"), "users");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("day"), "days");
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("match"), "matches");
        assert_eq!(pluralize("admin/user"), "admin/users");
        assert_eq!(pluralize(""), "");
    }

    #[test]
    fn test_id_partition() {
        assert_eq!(id_partition(1), "000/000/001");
        assert_eq!(id_partition(123456789), "123/456/789");
        assert_eq!(id_partition(0), "000/000/000");
        assert_eq!(id_partition(1234567890), "001/234/567/890");
        assert_eq!(id_partition(Id::MAX), "009/223/372/036/854/775/807");
        assert_eq!(id_partition(-5), "-/000/000/005");
    }
}
