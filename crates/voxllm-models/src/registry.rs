//! Compile-time catalog of known models.
//!
//! Entries are plain constant data; nothing here is mutated at runtime.
//! Custom descriptors can be built with [`ModelDescriptor::new`].

use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

/// Weight file container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelFormat {
    Gguf,
    Ggml,
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFormat::Gguf => write!(f, "GGUF"),
            ModelFormat::Ggml => write!(f, "GGML"),
        }
    }
}

/// Model registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    /// Identifier used for lookups and progress reports.
    pub name: Cow<'static, str>,
    /// Human-readable name.
    pub display_name: Cow<'static, str>,
    pub description: Cow<'static, str>,
    /// Download URL.
    pub url: Cow<'static, str>,
    /// Filename on disk.
    pub filename: Cow<'static, str>,
    /// Expected SHA256 checksum, hex encoded (optional).
    pub sha256: Option<Cow<'static, str>>,
    /// Expected size in bytes, used for admission and progress display.
    pub size_bytes: u64,
    pub format: ModelFormat,
    pub quantization: Cow<'static, str>,
    /// Minimum system RAM needed to run the model.
    pub min_ram_mb: u32,
    /// Suitable for Raspberry Pi class devices.
    pub recommended_for_embedded: bool,
}

impl ModelDescriptor {
    /// Build a descriptor at runtime. Display name defaults to `name`,
    /// format to GGUF, and no checksum is attached.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        filename: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let name = name.into();
        Self {
            display_name: Cow::Owned(name.clone()),
            name: Cow::Owned(name),
            description: Cow::Borrowed(""),
            url: Cow::Owned(url.into()),
            filename: Cow::Owned(filename.into()),
            sha256: None,
            size_bytes,
            format: ModelFormat::Gguf,
            quantization: Cow::Borrowed("unknown"),
            min_ram_mb: 0,
            recommended_for_embedded: false,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(Cow::Owned(sha256.into()));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Cow::Owned(description.into());
        self
    }

    pub fn with_format(mut self, format: ModelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Cow::Owned(quantization.into());
        self
    }

    pub fn with_min_ram_mb(mut self, min_ram_mb: u32) -> Self {
        self.min_ram_mb = min_ram_mb;
        self
    }

    pub fn embedded(mut self, recommended: bool) -> Self {
        self.recommended_for_embedded = recommended;
        self
    }

    /// Checksum to verify against, ignoring blank entries.
    pub fn checksum(&self) -> Option<&str> {
        self.sha256
            .as_deref()
            .map(str::trim)
            .filter(|sum| !sum.is_empty())
    }

    /// Size in mebibytes, for display.
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// TinyLlama 1.1B Chat, Q4_K_M.
pub const TINYLLAMA_1B_Q4: ModelDescriptor = ModelDescriptor {
    name: Cow::Borrowed("tinyllama-1.1b-chat-q4"),
    display_name: Cow::Borrowed("TinyLlama 1.1B Chat (Q4_K_M)"),
    description: Cow::Borrowed(
        "Lightweight chat model for basic conversations on resource-constrained devices",
    ),
    url: Cow::Borrowed(
        "https://huggingface.co/TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF/resolve/main/tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
    ),
    filename: Cow::Borrowed("tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf"),
    sha256: None,
    size_bytes: 668_788_096,
    format: ModelFormat::Gguf,
    quantization: Cow::Borrowed("Q4_K_M"),
    min_ram_mb: 1024,
    recommended_for_embedded: true,
};

/// Microsoft Phi-2 2.7B, Q4_K_M.
pub const PHI2_Q4: ModelDescriptor = ModelDescriptor {
    name: Cow::Borrowed("phi-2-q4"),
    display_name: Cow::Borrowed("Microsoft Phi-2 2.7B (Q4_K_M)"),
    description: Cow::Borrowed("High-quality small model, good fit for ARM devices"),
    url: Cow::Borrowed(
        "https://huggingface.co/TheBloke/phi-2-GGUF/resolve/main/phi-2.Q4_K_M.gguf",
    ),
    filename: Cow::Borrowed("phi-2.Q4_K_M.gguf"),
    sha256: None,
    size_bytes: 1_789_239_072,
    format: ModelFormat::Gguf,
    quantization: Cow::Borrowed("Q4_K_M"),
    min_ram_mb: 2048,
    recommended_for_embedded: true,
};

/// Mistral 7B Instruct v0.2, Q4_K_M.
pub const MISTRAL_7B_Q4: ModelDescriptor = ModelDescriptor {
    name: Cow::Borrowed("mistral-7b-instruct-q4"),
    display_name: Cow::Borrowed("Mistral 7B Instruct v0.2 (Q4_K_M)"),
    description: Cow::Borrowed("Strong instruction-following model for desktop-class hardware"),
    url: Cow::Borrowed(
        "https://huggingface.co/TheBloke/Mistral-7B-Instruct-v0.2-GGUF/resolve/main/mistral-7b-instruct-v0.2.Q4_K_M.gguf",
    ),
    filename: Cow::Borrowed("mistral-7b-instruct-v0.2.Q4_K_M.gguf"),
    sha256: None,
    size_bytes: 4_368_439_584,
    format: ModelFormat::Gguf,
    quantization: Cow::Borrowed("Q4_K_M"),
    min_ram_mb: 6144,
    recommended_for_embedded: false,
};

/// Llama 2 7B Chat, Q4_K_M.
pub const LLAMA2_7B_Q4: ModelDescriptor = ModelDescriptor {
    name: Cow::Borrowed("llama2-7b-chat-q4"),
    display_name: Cow::Borrowed("Llama 2 7B Chat (Q4_K_M)"),
    description: Cow::Borrowed("General-purpose chat model"),
    url: Cow::Borrowed(
        "https://huggingface.co/TheBloke/Llama-2-7B-Chat-GGUF/resolve/main/llama-2-7b-chat.Q4_K_M.gguf",
    ),
    filename: Cow::Borrowed("llama-2-7b-chat.Q4_K_M.gguf"),
    sha256: None,
    size_bytes: 4_081_004_224,
    format: ModelFormat::Gguf,
    quantization: Cow::Borrowed("Q4_K_M"),
    min_ram_mb: 6144,
    recommended_for_embedded: false,
};

static CATALOG: [ModelDescriptor; 4] = [TINYLLAMA_1B_Q4, PHI2_Q4, MISTRAL_7B_Q4, LLAMA2_7B_Q4];

/// All catalog entries.
pub fn all() -> &'static [ModelDescriptor] {
    &CATALOG
}

/// Look up a catalog entry by identifier (case-insensitive).
pub fn find(name: &str) -> Option<&'static ModelDescriptor> {
    CATALOG
        .iter()
        .find(|model| model.name.eq_ignore_ascii_case(name))
}

/// Catalog entries that fit into `ram_mb` of memory.
///
/// Embedded-friendly models come first, then ascending size.
pub fn recommended_for_ram(ram_mb: u64) -> Vec<&'static ModelDescriptor> {
    let mut models: Vec<_> = CATALOG
        .iter()
        .filter(|model| u64::from(model.min_ram_mb) <= ram_mb)
        .collect();
    models.sort_by_key(|model| (!model.recommended_for_embedded, model.size_bytes));
    models
}

/// Catalog entries that fit into this machine's total memory.
pub fn recommended_for_system() -> Vec<&'static ModelDescriptor> {
    recommended_for_ram(crate::storage::total_memory_mb())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_is_case_insensitive() {
        let model = find("TinyLlama-1.1B-Chat-Q4").unwrap();
        assert_eq!(model.filename, "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf");
        assert!(find("no-such-model").is_none());
    }

    #[test]
    fn test_catalog_entries_are_complete() {
        for model in all() {
            assert!(!model.name.is_empty());
            assert!(model.url.starts_with("https://"));
            assert!(model.url.ends_with(model.filename.as_ref()));
            assert!(model.size_bytes > 0);
            assert_eq!(model.format, ModelFormat::Gguf);
        }
    }

    #[test]
    fn test_recommended_for_ram() {
        let small = recommended_for_ram(1024);
        assert_eq!(small.len(), 1);
        assert_eq!(small[0].name, TINYLLAMA_1B_Q4.name);

        let large = recommended_for_ram(16 * 1024);
        assert_eq!(large.len(), 4);
        assert!(large[0].recommended_for_embedded);
        assert!(large[1].recommended_for_embedded);
        assert!(large[2].size_bytes <= large[3].size_bytes);

        assert!(recommended_for_ram(512).is_empty());
    }

    #[test]
    fn test_runtime_descriptor() {
        let model = ModelDescriptor::new("tiny", "http://localhost/tiny.gguf", "tiny.gguf", 1000)
            .with_sha256("  ")
            .with_quantization("Q8_0");
        assert_eq!(model.display_name, "tiny");
        assert_eq!(model.checksum(), None);
        assert_eq!(model.quantization, "Q8_0");
        assert_eq!(model.format.to_string(), "GGUF");
    }
}
