// Vulkan rendering instance
//
// This holds all of the common instance code for the Vulkan context
use ash::extensions::ext;
use ash::{vk, Entry};

use crate::{Result, SquallError};
use utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

// this happy little debug callback is from the ash examples
// all it does is print any errors/warnings thrown.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    log::error!(
        "[VK][{:?}][{:?}] {:?}",
        message_severity,
        message_types,
        CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
    );
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// any devices and such which the renderer will use internally.
pub struct Instance {
    /// debug callback sugar mentioned earlier
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    /// the entry just loads function pointers from the dynamic library
    /// I am calling it a loader, because that's what it does
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .unwrap()
        };
        return (dr_loader, callback);
    }

    /// Check which of the extensions we would like are actually present
    fn available_extensions(entry: &Entry, wanted: &[&'static CStr]) -> Vec<*const i8> {
        let props = entry
            .enumerate_instance_extension_properties(None)
            .unwrap_or_default();

        wanted
            .iter()
            .filter(|want| {
                props.iter().any(|prop| {
                    let name = unsafe { CStr::from_ptr(prop.extension_name.as_ptr()) };
                    name == **want
                })
            })
            .map(|want| want.as_ptr())
            .collect()
    }

    /// Create a vkInstance
    ///
    /// Most of the create info entries are straightforward, with
    /// some basic extensions being enabled. Surface extensions are
    /// the embedding layer's job, passed through `extensions`.
    pub fn new(extensions: &[&'static CStr]) -> Result<Self> {
        let entry = unsafe { Entry::load().or(Err(SquallError::VK_NOT_ALL_EXTENSIONS_AVAILABLE))? };
        let app_name = CString::new("squall").unwrap();

        let mut wanted: Vec<&'static CStr> = extensions.to_vec();
        if cfg!(debug_assertions) {
            wanted.push(ext::DebugUtils::name());
        }
        // Extension names must be unique in the create info
        let mut seen: Vec<&'static CStr> = Vec::new();
        wanted.retain(|e| {
            if seen.contains(e) {
                return false;
            }
            seen.push(*e);
            true
        });
        let extension_names_raw = Self::available_extensions(&entry, &wanted);
        let debug_wanted = cfg!(debug_assertions)
            && extension_names_raw
                .iter()
                .any(|&p| unsafe { CStr::from_ptr(p) } == ext::DebugUtils::name());

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_extension_names(&extension_names_raw);

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .or(Err(SquallError::CREATION_FAILED))?
        };

        let debug = match debug_wanted {
            true => Some(Self::setup_debug(&entry, &instance)),
            false => None,
        };

        Ok(Self {
            loader: entry,
            inst: instance,
            debug: debug,
        })
    }

    /// The raw handle, for embedding layers that create surfaces
    pub fn vk_instance(&self) -> &ash::Instance {
        &self.inst
    }

    pub fn vk_entry(&self) -> &Entry {
        &self.loader
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
