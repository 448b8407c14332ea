/*
 * kernel_info.rs
 *
 * Copyright (C) 2024 Posit Software, PBC. All rights reserved.
 *
 */

use serde::Deserialize;
use serde::Serialize;

/// Represents a help link in a Jupyter message
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HelpLink {
    /// The text to display for the link
    pub text: String,

    /// The location (URL) of the help link
    pub url: String,
}

/// Represents information about the language that the kernel implements
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LanguageInfo {
    /// The name of the programming language the kernel implements
    pub name: String,

    /// The version of the language
    #[serde(default)]
    pub version: String,

    /// The MIME type for script files in the language
    pub mimetype: Option<String>,

    /// The file extension for script files in the language
    pub file_extension: Option<String>,

    /// Pygments lexer (for highlighting), if different than `name`
    pub pygments_lexer: Option<String>,

    /// Codemirror mode (for editing), if different than `name`
    pub codemirror_mode: Option<serde_json::Value>,

    /// Nbconvert exporter, if not the default 'script' exporter
    pub nbconvert_exporter: Option<String>,
}

/// Represents a reply to a kernel_info_request
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KernelInfoReply {
    /// The execution status ("ok" or "error")
    #[serde(default = "default_status")]
    pub status: String,

    /// Version of messaging protocol
    pub protocol_version: String,

    /// The kernel implementation name
    pub implementation: Option<String>,

    /// The kernel implementation version
    pub implementation_version: Option<String>,

    /// Information about the language the kernel supports
    pub language_info: LanguageInfo,

    /// A startup banner
    #[serde(default)]
    pub banner: String,

    /// Whether debugging is supported
    #[serde(default)]
    pub debugger: bool,

    /// A list of help links
    #[serde(default)]
    pub help_links: Vec<HelpLink>,
}

fn default_status() -> String {
    String::from("ok")
}
