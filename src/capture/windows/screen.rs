//! Windows screen capture using GDI BitBlt
//!
//! Each capture copies the monitor rectangle, or the configured region of
//! it, out of the desktop DC into a top-down 32-bit DIB, which is already
//! BGRA.

use crate::capture::traits::{CaptureError, DisplayInfo, Frame, FrameSource};
use crate::config::Region;
use windows::{
    Win32::Foundation::{BOOL, LPARAM, RECT},
    Win32::Graphics::Gdi::{
        BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject,
        EnumDisplayMonitors, GetDC, GetDIBits, GetMonitorInfoW, ReleaseDC, SelectObject,
        BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, HDC, HMONITOR, MONITORINFOEXW,
        SRCCOPY,
    },
    Win32::UI::WindowsAndMessaging::GetDesktopWindow,
};

/// Get list of available displays on Windows
pub fn get_displays() -> Vec<DisplayInfo> {
    use std::mem::zeroed;

    let mut displays = Vec::new();
    let displays_ptr = &mut displays as *mut Vec<DisplayInfo>;

    unsafe extern "system" fn enum_monitors_callback(
        hmonitor: HMONITOR,
        _hdc: HDC,
        _rect: *mut RECT,
        lparam: LPARAM,
    ) -> BOOL {
        let displays = &mut *(lparam.0 as *mut Vec<DisplayInfo>);

        let mut monitor_info: MONITORINFOEXW = unsafe { zeroed() };
        monitor_info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;

        if unsafe { GetMonitorInfoW(hmonitor, &mut monitor_info.monitorInfo) }.as_bool() {
            let rect = monitor_info.monitorInfo.rcMonitor;
            // MONITORINFOF_PRIMARY
            let is_primary = monitor_info.monitorInfo.dwFlags & 1 != 0;
            let name_len = monitor_info
                .szDevice
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(monitor_info.szDevice.len());

            displays.push(DisplayInfo {
                id: displays.len() as u32,
                name: String::from_utf16_lossy(&monitor_info.szDevice[..name_len]),
                x: rect.left,
                y: rect.top,
                width: (rect.right - rect.left) as u32,
                height: (rect.bottom - rect.top) as u32,
                is_primary,
            });
        }

        BOOL::from(true)
    }

    unsafe {
        let _ = EnumDisplayMonitors(
            HDC::default(),
            None,
            Some(enum_monitors_callback),
            LPARAM(displays_ptr as isize),
        );
    }

    displays
}

/// Copy one rectangle of the desktop into a BGRA buffer
fn capture_rect(x: i32, y: i32, width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    use std::mem::zeroed;

    unsafe {
        let hwnd = GetDesktopWindow();
        let hdc_screen = GetDC(hwnd);
        if hdc_screen.is_invalid() {
            return Err(CaptureError::Failed("GetDC returned no desktop context".to_string()));
        }

        let hdc_mem = CreateCompatibleDC(hdc_screen);
        if hdc_mem.is_invalid() {
            ReleaseDC(hwnd, hdc_screen);
            return Err(CaptureError::Failed("CreateCompatibleDC failed".to_string()));
        }

        let hbitmap = CreateCompatibleBitmap(hdc_screen, width as i32, height as i32);
        if hbitmap.is_invalid() {
            let _ = DeleteDC(hdc_mem);
            ReleaseDC(hwnd, hdc_screen);
            return Err(CaptureError::Failed("CreateCompatibleBitmap failed".to_string()));
        }

        let old_bitmap = SelectObject(hdc_mem, hbitmap);
        let copied = BitBlt(
            hdc_mem,
            0,
            0,
            width as i32,
            height as i32,
            hdc_screen,
            x,
            y,
            SRCCOPY,
        );

        let mut buffer = vec![0u8; width as usize * height as usize * 4];
        let mut lines = 0;
        if copied.is_ok() {
            let mut bmi: BITMAPINFO = zeroed();
            bmi.bmiHeader.biSize = std::mem::size_of::<BITMAPINFOHEADER>() as u32;
            bmi.bmiHeader.biWidth = width as i32;
            // Negative height gives a top-down DIB
            bmi.bmiHeader.biHeight = -(height as i32);
            bmi.bmiHeader.biPlanes = 1;
            bmi.bmiHeader.biBitCount = 32;
            bmi.bmiHeader.biCompression = BI_RGB.0;

            lines = GetDIBits(
                hdc_mem,
                hbitmap,
                0,
                height,
                Some(buffer.as_mut_ptr() as *mut _),
                &mut bmi,
                DIB_RGB_COLORS,
            );
        }

        SelectObject(hdc_mem, old_bitmap);
        let _ = DeleteObject(hbitmap);
        let _ = DeleteDC(hdc_mem);
        ReleaseDC(hwnd, hdc_screen);

        if lines == 0 {
            return Err(CaptureError::Failed("BitBlt/GetDIBits copied nothing".to_string()));
        }

        Ok(buffer)
    }
}

/// In-process capture of one monitor, or a region of it
pub struct DisplaySource {
    id: String,
    /// Desktop rectangle copied on every capture
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

impl DisplaySource {
    pub fn open(display_id: u32, region: Option<Region>) -> Result<Self, CaptureError> {
        let display = get_displays()
            .into_iter()
            .find(|d| d.id == display_id)
            .ok_or(CaptureError::DisplayNotFound(display_id))?;

        // GDI copies the region straight off the desktop, no crop pass needed
        let area = match region {
            Some(region) => region.clamp_to(display.width, display.height).ok_or_else(|| {
                CaptureError::Failed(format!(
                    "region {:?} lies outside display {} ({}x{})",
                    region, display_id, display.width, display.height
                ))
            })?,
            None => Region {
                left: 0,
                top: 0,
                width: display.width,
                height: display.height,
            },
        };

        let source = Self {
            id: format!("display-{}", display_id),
            x: display.x + area.left as i32,
            y: display.y + area.top as i32,
            width: area.width,
            height: area.height,
        };

        tracing::info!(
            "Windows display source {} ({}) at {},{} {}x{}",
            display_id,
            display.name,
            source.x,
            source.y,
            source.width,
            source.height
        );

        Ok(source)
    }
}

impl FrameSource for DisplaySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let data = capture_rect(self.x, self.y, self.width, self.height)?;
        Ok(Frame::new(self.width, self.height, data))
    }
}
