//! `AttachableLibrary` — reference-counted dynamic loading of a compiler plugin
//! (spec.md §4.5). Grounded in
//! `original_source/ConsoleRig/AttachableLibrary_Posix.cpp`'s `dlopen`/`dlsym`
//! reference-counting, reimplemented over `libloading` instead of raw `dlfcn.h`
//! calls.

use crate::error::{Error, Result};
use libloading::{Library, Symbol};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

/// `{ version_string, build_date_string }` — spec.md §6's `LibVersionDesc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibVersionDesc {
    pub version_string: String,
    pub build_date_string: String,
}

/// Raw C ABI a compiler plugin must export (spec.md §6). These are the exact
/// exported-symbol signatures; `PluginCompilerDelegate` (in `super`) wraps
/// `CreateCompileOperation` into the in-process [`crate::compiler::CompilerDelegate`]
/// trait this crate's registry understands.
pub mod symbols {
    /// `ConsoleRig::LibVersionDesc GetVersionInformation()`.
    pub type GetVersionInformationFn = unsafe extern "C" fn() -> (*const u8, usize, *const u8, usize);
    /// `void AttachLibrary(CrossModule& host)`.
    pub type AttachLibraryFn = unsafe extern "C" fn(*mut std::ffi::c_void);
    /// `void DetachLibrary()`.
    pub type DetachLibraryFn = unsafe extern "C" fn();
}

struct State {
    library: Option<Library>,
    attach_count: u32,
    version: Option<LibVersionDesc>,
}

/// A dynamically-loaded compiler plugin library (spec.md §4.5).
///
/// Reference-counted: the first [`AttachableLibrary::try_attach`] actually
/// `dlopen`s the library and calls its exported `AttachLibrary`; subsequent
/// attaches just bump the count. The matching number of [`AttachableLibrary::detach`]
/// calls unloads it, first calling `DetachLibrary` if exported.
pub struct AttachableLibrary {
    path: PathBuf,
    state: Mutex<State>,
}

impl AttachableLibrary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), state: Mutex::new(State { library: None, attach_count: 0, version: None }) }
    }

    /// `TryAttach(&error)` — spec.md §4.5.
    pub fn try_attach(&self, cross_module: *mut std::ffi::c_void) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.attach_count == 0 {
            // SAFETY: loading an arbitrary shared library is inherently unsafe; the
            // caller is responsible for only pointing this at trusted compiler plugins
            // (spec.md §1: plugins are an out-of-scope external collaborator).
            let library = unsafe { Library::new(&self.path) }
                .map_err(|e| Error::PluginAttachFailed { path: self.path.clone(), reason: e.to_string() })?;

            // SAFETY: symbol lookups below match the exported C ABI spec.md §6 requires;
            // a mismatched export is a malformed plugin, reported as an attach failure
            // rather than undefined behavior avoided.
            unsafe {
                if let Ok(attach_fn) = library.get::<symbols::AttachLibraryFn>(b"AttachLibrary\0") {
                    attach_fn(cross_module);
                }
                if let Ok(version_fn) = library.get::<symbols::GetVersionInformationFn>(b"GetVersionInformation\0") {
                    let (v_ptr, v_len, d_ptr, d_len) = version_fn();
                    let version_string = std::slice::from_raw_parts(v_ptr, v_len);
                    let build_date_string = std::slice::from_raw_parts(d_ptr, d_len);
                    state.version = Some(LibVersionDesc {
                        version_string: String::from_utf8_lossy(version_string).into_owned(),
                        build_date_string: String::from_utf8_lossy(build_date_string).into_owned(),
                    });
                }
            }

            state.library = Some(library);
        }

        state.attach_count += 1;
        Ok(())
    }

    /// `Detach()` — spec.md §4.5.
    pub fn detach(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.attach_count > 0, "AttachableLibrary detached more times than attached");
        state.attach_count -= 1;

        if state.attach_count == 0 {
            if let Some(library) = &state.library {
                // SAFETY: `DetachLibrary`, if exported, matches spec.md §6's signature.
                unsafe {
                    if let Ok(detach_fn) = library.get::<symbols::DetachLibraryFn>(b"DetachLibrary\0") {
                        detach_fn();
                    }
                }
            }
            state.library = None; // dropping `Library` unloads it
            state.version = None;
        }
    }

    /// `TryGetVersion(&out)` — spec.md §4.5.
    pub fn try_get_version(&self) -> Option<LibVersionDesc> {
        self.state.lock().unwrap().version.clone()
    }

    /// `GetFunction<sig>(name)` — spec.md §4.5. Resolves a named symbol and copies
    /// out the raw function pointer, cast to the caller-supplied signature. Returns
    /// `None` on absence (or if the library isn't currently attached).
    ///
    /// # Safety
    /// The caller must ensure `T` (a function-pointer type) matches the actual
    /// signature exported by the plugin under `name`.
    pub unsafe fn get_function<T: Copy>(&self, name: &[u8]) -> Option<T> {
        let state = self.state.lock().unwrap();
        if state.attach_count == 0 {
            return None;
        }
        let library = state.library.as_ref()?;
        // SAFETY: caller-guaranteed signature match, per this function's contract.
        let symbol: Symbol<'_, T> = unsafe { library.get(name).ok()? };
        Some(*symbol)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
