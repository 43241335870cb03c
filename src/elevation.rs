//! # Elevation Module
//!
//! RimSort is often installed under `C:\Program Files`, which a standard user cannot
//! write to. When the install folder fails the write probe, `update.exe` asks for
//! administrator rights by relaunching itself through the `runas` verb, which
//! triggers the UAC prompt. The elevated copy redoes the whole run while the
//! original process waits and passes its exit code on to the caller.

use std::ffi::{OsStr, OsString};
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use log::{info, warn};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Security::{GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation};
use windows::Win32::System::Threading::{
    GetCurrentProcess, GetExitCodeProcess, INFINITE, OpenProcessToken, WaitForSingleObject,
};
use windows::Win32::UI::Shell::{SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW, ShellExecuteExW};
use windows::Win32::UI::WindowsAndMessaging::SW_SHOWNORMAL;
use windows::core::{PCWSTR, w};

/// Checks if the current process runs with an elevated token.
pub fn is_elevated() -> bool {
    let mut token = HANDLE::default();
    unsafe {
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token).is_err() {
            return false;
        }
        let mut elevation = TOKEN_ELEVATION::default();
        let mut size = 0;
        let queried = GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut size,
        );
        let _ = CloseHandle(token);
        queried.is_ok() && elevation.TokenIsElevated != 0
    }
}

/// Quotes one argument for a Windows command line, as UTF-16.
///
/// Paths with spaces (`C:\Program Files\RimSort`) are the common case here. Only
/// ASCII code units are special, so any other text passes through untouched.
pub fn quote_arg(arg: &OsStr) -> Vec<u16> {
    const SPACE: u16 = b' ' as u16;
    const TAB: u16 = b'\t' as u16;
    const QUOTE: u16 = b'"' as u16;
    const BACKSLASH: u16 = b'\\' as u16;

    let units: Vec<u16> = arg.encode_wide().collect();
    if !units.is_empty() && !units.iter().any(|u| matches!(*u, SPACE | TAB | QUOTE)) {
        return units;
    }

    let mut quoted = Vec::with_capacity(units.len() + 2);
    quoted.push(QUOTE);
    let mut backslashes = 0;
    for unit in units {
        match unit {
            BACKSLASH => backslashes += 1,
            QUOTE => {
                quoted.extend(std::iter::repeat_n(BACKSLASH, backslashes * 2 + 1));
                quoted.push(QUOTE);
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat_n(BACKSLASH, backslashes));
                backslashes = 0;
                quoted.push(unit);
            }
        }
    }
    // Backslashes before the closing quote must be doubled.
    quoted.extend(std::iter::repeat_n(BACKSLASH, backslashes * 2));
    quoted.push(QUOTE);
    quoted
}

/// Joins quoted arguments into a NUL-terminated command line.
fn command_line(args: &[OsString]) -> Vec<u16> {
    let mut line = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(b' ' as u16);
        }
        line.extend(quote_arg(arg));
    }
    line.push(0);
    line
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Relaunches this executable elevated with `args`, starting in `workdir`, and
/// waits for it.
///
/// An elevated process otherwise starts in `System32`, which would break relative
/// paths and the "install folder defaults to the current directory" rule.
///
/// Returns the elevated run's exit code, or `None` if the user declined the prompt
/// or the call failed.
pub fn relaunch_elevated(args: &[OsString], workdir: &Path) -> Option<i32> {
    let exe_path = std::env::current_exe().ok()?;
    let file = wide(exe_path.as_os_str());
    let parameters = command_line(args);
    let directory = wide(workdir.as_os_str());

    info!("Relaunching elevated: {:?} {:?}", exe_path, args);

    let mut info = SHELLEXECUTEINFOW {
        cbSize: std::mem::size_of::<SHELLEXECUTEINFOW>() as u32,
        fMask: SEE_MASK_NOCLOSEPROCESS,
        lpVerb: w!("runas"),
        lpFile: PCWSTR(file.as_ptr()),
        lpParameters: PCWSTR(parameters.as_ptr()),
        lpDirectory: PCWSTR(directory.as_ptr()),
        nShow: SW_SHOWNORMAL.0,
        ..Default::default()
    };

    unsafe {
        // Fails with ERROR_CANCELLED when the prompt is declined.
        if let Err(e) = ShellExecuteExW(&mut info) {
            warn!("Elevated launch failed: {}", e);
            return None;
        }
        if info.hProcess.is_invalid() {
            return None;
        }
        let _ = WaitForSingleObject(info.hProcess, INFINITE);
        let mut code = 1u32;
        let queried = GetExitCodeProcess(info.hProcess, &mut code);
        let _ = CloseHandle(info.hProcess);
        Some(if queried.is_ok() { code as i32 } else { 1 })
    }
}
