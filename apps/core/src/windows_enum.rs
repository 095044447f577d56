use crate::discovery::{ScanContext, SourceError, WindowSource};
use crate::model::{ExecutionMode, SourceDescriptor, WindowFacts};

pub const TOP_LEVEL_SOURCE: &str = "Windows";
pub const MDI_DOCUMENT_SOURCE: &str = "MdiDocuments";

/// Visible, unowned, uncloaked top-level windows with a title.
pub struct TopLevelWindowSource {
    descriptor: SourceDescriptor,
}

impl Default for TopLevelWindowSource {
    fn default() -> Self {
        Self {
            descriptor: SourceDescriptor::new(TOP_LEVEL_SOURCE, ExecutionMode::InProcess),
        }
    }
}

impl WindowSource for TopLevelWindowSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[cfg(target_os = "windows")]
    fn scan(&self, ctx: &ScanContext) -> Result<Vec<WindowFacts>, SourceError> {
        let mut windows = native::top_level_windows()?;
        ctx.retain_allowed(&mut windows);
        Ok(windows)
    }

    #[cfg(not(target_os = "windows"))]
    fn scan(&self, _ctx: &ScanContext) -> Result<Vec<WindowFacts>, SourceError> {
        Ok(Vec::new())
    }
}

/// Documents hosted in classic MDI frames (an `MDIClient` child holding one
/// window per document). Runs isolated: it walks every top-level window's
/// child tree on each call.
pub struct MdiDocumentSource {
    descriptor: SourceDescriptor,
}

impl Default for MdiDocumentSource {
    fn default() -> Self {
        Self {
            descriptor: SourceDescriptor::new(MDI_DOCUMENT_SOURCE, ExecutionMode::Isolated),
        }
    }
}

impl WindowSource for MdiDocumentSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[cfg(target_os = "windows")]
    fn scan(&self, ctx: &ScanContext) -> Result<Vec<WindowFacts>, SourceError> {
        let mut windows = native::mdi_documents()?;
        ctx.retain_allowed(&mut windows);
        Ok(windows)
    }

    #[cfg(not(target_os = "windows"))]
    fn scan(&self, _ctx: &ScanContext) -> Result<Vec<WindowFacts>, SourceError> {
        Ok(Vec::new())
    }
}

#[cfg(target_os = "windows")]
mod native {
    use std::ffi::c_void;

    use windows_sys::Win32::Foundation::{CloseHandle, BOOL, HWND, LPARAM};
    use windows_sys::Win32::Graphics::Dwm::{DwmGetWindowAttribute, DWMWA_CLOAKED};
    use windows_sys::Win32::System::Threading::{
        OpenProcess, QueryFullProcessImageNameW, PROCESS_NAME_WIN32,
        PROCESS_QUERY_LIMITED_INFORMATION,
    };
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        EnumChildWindows, EnumWindows, GetClassNameW, GetParent, GetWindow, GetWindowTextLengthW,
        GetWindowTextW, GetWindowThreadProcessId, IsWindowVisible, GW_OWNER,
    };

    use crate::discovery::SourceError;
    use crate::model::WindowFacts;

    unsafe extern "system" fn collect_hwnd(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let out = &mut *(lparam as *mut Vec<HWND>);
        out.push(hwnd);
        1
    }

    fn top_level_hwnds() -> Result<Vec<HWND>, SourceError> {
        let mut hwnds: Vec<HWND> = Vec::new();
        let ok = unsafe { EnumWindows(Some(collect_hwnd), &mut hwnds as *mut Vec<HWND> as LPARAM) };
        if ok == 0 {
            return Err(SourceError::scan("EnumWindows failed"));
        }
        Ok(hwnds)
    }

    fn child_hwnds(parent: HWND) -> Vec<HWND> {
        let mut hwnds: Vec<HWND> = Vec::new();
        unsafe {
            EnumChildWindows(
                parent,
                Some(collect_hwnd),
                &mut hwnds as *mut Vec<HWND> as LPARAM,
            );
        }
        hwnds
    }

    pub(super) fn top_level_windows() -> Result<Vec<WindowFacts>, SourceError> {
        let mut out = Vec::new();
        for hwnd in top_level_hwnds()? {
            if !is_switchable(hwnd) {
                continue;
            }
            let Some(title) = window_title(hwnd) else {
                continue;
            };
            out.push(facts_for(hwnd, title, process_id(hwnd)));
        }
        Ok(out)
    }

    pub(super) fn mdi_documents() -> Result<Vec<WindowFacts>, SourceError> {
        let mut out = Vec::new();
        for frame in top_level_hwnds()? {
            if !is_switchable(frame) {
                continue;
            }
            let pid = process_id(frame);
            for child in child_hwnds(frame) {
                let parent = unsafe { GetParent(child) };
                if parent.is_null() || class_name(parent) != "MDIClient" {
                    continue;
                }
                if unsafe { IsWindowVisible(child) } == 0 {
                    continue;
                }
                if let Some(title) = window_title(child) {
                    out.push(facts_for(child, title, pid));
                }
            }
        }
        Ok(out)
    }

    fn facts_for(hwnd: HWND, title: String, pid: u32) -> WindowFacts {
        let image = process_image_path(pid);
        let process_name = image
            .as_deref()
            .and_then(|path| std::path::Path::new(path).file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        WindowFacts {
            hwnd: crate::model::WindowHandle(hwnd as isize),
            title,
            process_name,
            executable_path: image,
        }
    }

    fn is_switchable(hwnd: HWND) -> bool {
        unsafe {
            if IsWindowVisible(hwnd) == 0 {
                return false;
            }
            if !GetWindow(hwnd, GW_OWNER).is_null() {
                return false;
            }
        }
        !is_cloaked(hwnd)
    }

    fn is_cloaked(hwnd: HWND) -> bool {
        let mut cloaked: u32 = 0;
        let hr = unsafe {
            DwmGetWindowAttribute(
                hwnd,
                DWMWA_CLOAKED as u32,
                &mut cloaked as *mut u32 as *mut c_void,
                std::mem::size_of::<u32>() as u32,
            )
        };
        hr == 0 && cloaked != 0
    }

    fn window_title(hwnd: HWND) -> Option<String> {
        let len = unsafe { GetWindowTextLengthW(hwnd) };
        if len <= 0 {
            return None;
        }
        let mut buffer = vec![0u16; len as usize + 1];
        let copied = unsafe { GetWindowTextW(hwnd, buffer.as_mut_ptr(), buffer.len() as i32) };
        if copied <= 0 {
            return None;
        }
        let title = String::from_utf16_lossy(&buffer[..copied as usize]);
        let trimmed = title.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn class_name(hwnd: HWND) -> String {
        let mut buffer = [0u16; 256];
        let len = unsafe { GetClassNameW(hwnd, buffer.as_mut_ptr(), buffer.len() as i32) };
        if len <= 0 {
            return String::new();
        }
        String::from_utf16_lossy(&buffer[..len as usize])
    }

    fn process_id(hwnd: HWND) -> u32 {
        let mut pid: u32 = 0;
        unsafe {
            GetWindowThreadProcessId(hwnd, &mut pid);
        }
        pid
    }

    fn process_image_path(pid: u32) -> Option<String> {
        if pid == 0 {
            return None;
        }
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return None;
            }
            let mut buffer = [0u16; 1024];
            let mut size = buffer.len() as u32;
            let ok = QueryFullProcessImageNameW(
                handle,
                PROCESS_NAME_WIN32,
                buffer.as_mut_ptr(),
                &mut size,
            );
            CloseHandle(handle);
            if ok == 0 {
                return None;
            }
            Some(String::from_utf16_lossy(&buffer[..size as usize]))
        }
    }
}
