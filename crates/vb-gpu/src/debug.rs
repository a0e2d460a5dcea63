//! Validation message routing.
//!
//! The debug messenger does not log on its own. It forwards every message to a
//! [`DebugSink`] owned by the device context, so callers decide where
//! validation output goes. [`TracingSink`] is the default.

use std::ffi::{c_void, CStr};
use std::sync::Arc;

use ash::vk;

use crate::error::Result;

/// Message severity reported by the validation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Map a single Vulkan severity bit. Unknown bits collapse to `Verbose`.
    pub fn from_vk(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            Self::Error
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            Self::Warning
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            Self::Info
        } else {
            Self::Verbose
        }
    }
}

/// Receiver for validation layer messages.
pub trait DebugSink: Send + Sync {
    /// Handle one message. `kind` is `general`, `validation` or `performance`.
    fn message(&self, severity: Severity, kind: &'static str, message: &str);
}

/// Forwards validation messages to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DebugSink for TracingSink {
    fn message(&self, severity: Severity, kind: &'static str, message: &str) {
        match severity {
            Severity::Verbose => tracing::trace!(target: "vb_gpu::validation", kind, "{message}"),
            Severity::Info => tracing::debug!(target: "vb_gpu::validation", kind, "{message}"),
            Severity::Warning => tracing::warn!(target: "vb_gpu::validation", kind, "{message}"),
            Severity::Error => tracing::error!(target: "vb_gpu::validation", kind, "{message}"),
        }
    }
}

fn message_kind(flags: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if flags.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if flags.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

/// Debug messenger bound to a sink.
pub(crate) struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
    // Boxed so the pointer handed to the driver stays stable.
    _sink: Box<Arc<dyn DebugSink>>,
}

impl DebugMessenger {
    /// Create a messenger that forwards to `sink`.
    ///
    /// # Safety
    /// The instance must have been created with `VK_EXT_debug_utils` enabled.
    pub(crate) unsafe fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        sink: Arc<dyn DebugSink>,
    ) -> Result<Self> {
        let sink = Box::new(sink);
        let user_data = std::ptr::from_ref::<Arc<dyn DebugSink>>(&sink)
            .cast_mut()
            .cast::<c_void>();

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(user_data);

        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        // SAFETY: the sink outlives the messenger; both are dropped together in `destroy`.
        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None)? };

        Ok(Self {
            loader,
            messenger,
            _sink: sink,
        })
    }

    /// Destroy the messenger.
    ///
    /// # Safety
    /// Must be called before the owning instance is destroyed.
    pub(crate) unsafe fn destroy(&self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }

    // SAFETY: user data was set to a live `Arc<dyn DebugSink>` in `DebugMessenger::new`.
    let sink = unsafe { &*p_user_data.cast::<Arc<dyn DebugSink>>() };
    // SAFETY: the driver passes valid callback data for the duration of the call.
    let data = unsafe { &*p_callback_data };
    let message = if data.p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        // SAFETY: non-null message pointers are NUL-terminated strings.
        unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
    };

    sink.message(
        Severity::from_vk(message_severity),
        message_kind(message_type),
        &message,
    );

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<(Severity, &'static str, String)>>,
    }

    impl DebugSink for RecordingSink {
        fn message(&self, severity: Severity, kind: &'static str, message: &str) {
            self.messages
                .lock()
                .push((severity, kind, message.to_string()));
        }
    }

    #[test]
    fn severity_mapping() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(Severity::from_vk(S::VERBOSE), Severity::Verbose);
        assert_eq!(Severity::from_vk(S::INFO), Severity::Info);
        assert_eq!(Severity::from_vk(S::WARNING), Severity::Warning);
        assert_eq!(Severity::from_vk(S::ERROR), Severity::Error);
        assert_eq!(Severity::from_vk(S::WARNING | S::ERROR), Severity::Error);
    }

    #[test]
    fn callback_forwards_to_injected_sink() {
        let recording = Arc::new(RecordingSink::default());
        let sink: Arc<dyn DebugSink> = recording.clone();
        let boxed = Box::new(sink);
        let user_data = std::ptr::from_ref::<Arc<dyn DebugSink>>(&boxed)
            .cast_mut()
            .cast::<c_void>();

        let text = c"vkCmdDraw: pipeline not bound";
        let mut data = vk::DebugUtilsMessengerCallbackDataEXT::default();
        data.p_message = text.as_ptr();

        let result = unsafe {
            debug_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                &data,
                user_data,
            )
        };

        assert_eq!(result, vk::FALSE);
        let messages = recording.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, Severity::Warning);
        assert_eq!(messages[0].1, "validation");
        assert_eq!(messages[0].2, "vkCmdDraw: pipeline not bound");
    }

    #[test]
    fn callback_ignores_missing_user_data() {
        let data = vk::DebugUtilsMessengerCallbackDataEXT::default();
        let result = unsafe {
            debug_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL,
                &data,
                std::ptr::null_mut(),
            )
        };
        assert_eq!(result, vk::FALSE);
    }
}
