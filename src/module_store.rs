//! Installed scheduler modules.
//!
//! A module is a compiled sched_ext BPF object. The store resolves the
//! references a profile uses into module identities and checks that the file
//! behind each reference is actually loadable as a struct_ops scheduler.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use object::{Architecture, BinaryFormat, Object, ObjectKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default directory holding installed modules
pub const DEFAULT_MODULE_DIR: &str = "/var/lib/scx-adapt/obj";

/// Section every sched_ext struct_ops object carries
pub const STRUCT_OPS_LINK_SECTION: &str = ".struct_ops.link";

/// Identity of a scheduler module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleId {
    /// File name of the object, e.g. `fifo.bpf.c.o`
    pub name: String,
    /// Resolved path of the object file
    pub path: PathBuf,
}

impl ModuleId {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Why a module reference could not be accepted
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read module {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not an object file: {}", .0.display())]
    NotElf(PathBuf),
    #[error("not a BPF object file: {}", .0.display())]
    NotBpf(PathBuf),
    #[error("doesn't include '.struct_ops.link' section: {}", .0.display())]
    NoStructOps(PathBuf),
}

/// A queryable collection of installed modules
pub trait ModuleStore {
    /// Resolve a profile reference into a module identity, checking that it
    /// exists and has the expected binary shape.
    fn resolve(&self, reference: &str) -> Result<ModuleId, ModuleError>;

    /// List installed modules
    fn list(&self) -> Result<Vec<ModuleId>, ModuleError>;
}

/// Modules installed as files in a directory
#[derive(Debug, Clone)]
pub struct DirModuleStore {
    root: PathBuf,
}

impl Default for DirModuleStore {
    fn default() -> Self {
        Self::new(DEFAULT_MODULE_DIR)
    }
}

impl DirModuleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModuleStore for DirModuleStore {
    fn resolve(&self, reference: &str) -> Result<ModuleId, ModuleError> {
        let reference = Path::new(reference);
        // Absolute paths skip the store directory but not the checks below.
        let path = if reference.is_absolute() {
            reference.to_path_buf()
        } else {
            self.root.join(reference)
        };

        inspect_object(&path)?;

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| ModuleError::NotFound(path.clone()))?;
        debug!(module = %name, path = %path.display(), "module resolved");
        Ok(ModuleId { name, path })
    }

    fn list(&self) -> Result<Vec<ModuleId>, ModuleError> {
        let entries = fs::read_dir(&self.root).map_err(|source| ModuleError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut modules = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ModuleError::Io {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            modules.push(ModuleId {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
            });
        }
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(modules)
    }
}

/// In-memory catalog of module names, with no file access
#[derive(Debug, Clone, Default)]
pub struct StaticModuleStore {
    installed: BTreeSet<String>,
}

impl StaticModuleStore {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            installed: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl ModuleStore for StaticModuleStore {
    fn resolve(&self, reference: &str) -> Result<ModuleId, ModuleError> {
        if self.installed.contains(reference) {
            Ok(ModuleId::new(reference, reference))
        } else {
            Err(ModuleError::NotFound(PathBuf::from(reference)))
        }
    }

    fn list(&self) -> Result<Vec<ModuleId>, ModuleError> {
        Ok(self
            .installed
            .iter()
            .map(|name| ModuleId::new(name.as_str(), name.as_str()))
            .collect())
    }
}

/// Check that `path` is a relocatable BPF ELF object with a
/// `.struct_ops.link` section.
pub fn inspect_object(path: &Path) -> Result<(), ModuleError> {
    let data = fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ModuleError::NotFound(path.to_path_buf())
        } else {
            ModuleError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let file = object::File::parse(data.as_slice())
        .ok()
        .filter(|file| file.format() == BinaryFormat::Elf)
        .ok_or_else(|| ModuleError::NotElf(path.to_path_buf()))?;

    if file.architecture() != Architecture::Bpf || file.kind() != ObjectKind::Relocatable {
        return Err(ModuleError::NotBpf(path.to_path_buf()));
    }

    if file.section_by_name(STRUCT_OPS_LINK_SECTION).is_none() {
        return Err(ModuleError::NoStructOps(path.to_path_buf()));
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use object::elf::{
        ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_BPF, EM_X86_64, ET_EXEC, ET_REL, EV_CURRENT,
        SHT_STRTAB,
    };

    const ELF64_HEADER_LEN: usize = 64;
    const ELF64_SECTION_HEADER_LEN: usize = 64;

    /// Builds a minimal little-endian ELF64 image with the given header fields
    /// and section names.
    pub(crate) fn elf_image(e_type: u16, e_machine: u16, sections: &[&str]) -> Vec<u8> {
        // String table: leading NUL, then each name NUL-terminated, then ".shstrtab".
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for name in sections.iter().chain(std::iter::once(&".shstrtab")) {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        let strtab_offset = ELF64_HEADER_LEN;
        let shoff = strtab_offset + strtab.len();
        // Null section + named sections + .shstrtab
        let shnum = sections.len() + 2;
        let shstrndx = shnum - 1;

        let mut image = vec![0u8; ELF64_HEADER_LEN];
        image[..4].copy_from_slice(&ELFMAG);
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        image[6] = EV_CURRENT;
        image[16..18].copy_from_slice(&e_type.to_le_bytes());
        image[18..20].copy_from_slice(&e_machine.to_le_bytes());
        image[20..24].copy_from_slice(&1u32.to_le_bytes());
        image[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());
        image[52..54].copy_from_slice(&(ELF64_HEADER_LEN as u16).to_le_bytes());
        image[58..60].copy_from_slice(&(ELF64_SECTION_HEADER_LEN as u16).to_le_bytes());
        image[60..62].copy_from_slice(&(shnum as u16).to_le_bytes());
        image[62..64].copy_from_slice(&(shstrndx as u16).to_le_bytes());
        image.extend_from_slice(&strtab);

        image.extend_from_slice(&[0u8; ELF64_SECTION_HEADER_LEN]);
        for (index, offset) in name_offsets.iter().enumerate() {
            let mut header = [0u8; ELF64_SECTION_HEADER_LEN];
            header[..4].copy_from_slice(&offset.to_le_bytes());
            if index == name_offsets.len() - 1 {
                header[4..8].copy_from_slice(&SHT_STRTAB.to_le_bytes());
                header[24..32].copy_from_slice(&(strtab_offset as u64).to_le_bytes());
                header[32..40].copy_from_slice(&(strtab.len() as u64).to_le_bytes());
            }
            image.extend_from_slice(&header);
        }
        image
    }

    pub(crate) fn scheduler_image() -> Vec<u8> {
        elf_image(ET_REL, EM_BPF, &[".text", "struct_ops.link", STRUCT_OPS_LINK_SECTION])
    }

    #[test]
    fn accepts_struct_ops_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo.bpf.c.o");
        fs::write(&path, scheduler_image()).unwrap();

        inspect_object(&path).unwrap();
    }

    #[test]
    fn rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = inspect_object(&dir.path().join("absent.o")).unwrap_err();
        assert!(matches!(err, ModuleError::NotFound(_)));
    }

    #[test]
    fn rejects_non_elf_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"interval: 1000\n").unwrap();

        assert!(matches!(inspect_object(&path), Err(ModuleError::NotElf(_))));
    }

    #[test]
    fn rejects_non_bpf_machine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x86.o");
        fs::write(&path, elf_image(ET_REL, EM_X86_64, &[STRUCT_OPS_LINK_SECTION])).unwrap();

        assert!(matches!(inspect_object(&path), Err(ModuleError::NotBpf(_))));
    }

    #[test]
    fn rejects_executable_bpf_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.o");
        fs::write(&path, elf_image(ET_EXEC, EM_BPF, &[STRUCT_OPS_LINK_SECTION])).unwrap();

        assert!(matches!(inspect_object(&path), Err(ModuleError::NotBpf(_))));
    }

    #[test]
    fn rejects_truncated_elf_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.o");
        fs::write(&path, &scheduler_image()[..40]).unwrap();

        assert!(matches!(inspect_object(&path), Err(ModuleError::NotElf(_))));
    }

    #[test]
    fn rejects_bpf_object_without_struct_ops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracer.o");
        fs::write(&path, elf_image(ET_REL, EM_BPF, &[".text", "maps"])).unwrap();

        assert!(matches!(inspect_object(&path), Err(ModuleError::NoStructOps(_))));
    }

    #[test]
    fn dir_store_resolves_relative_and_absolute_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lottery.bpf.c.o");
        fs::write(&path, scheduler_image()).unwrap();
        let store = DirModuleStore::new(dir.path());

        let relative = store.resolve("lottery.bpf.c.o").unwrap();
        assert_eq!(relative, ModuleId::new("lottery.bpf.c.o", path.clone()));

        let absolute = store.resolve(path.to_str().unwrap()).unwrap();
        assert_eq!(absolute, relative);
    }

    #[test]
    fn dir_store_checks_absolute_references_too() {
        let store_dir = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let path = elsewhere.path().join("bogus.o");
        fs::write(&path, b"not an object").unwrap();

        let store = DirModuleStore::new(store_dir.path());
        assert!(matches!(
            store.resolve(path.to_str().unwrap()),
            Err(ModuleError::NotElf(_))
        ));
    }

    #[test]
    fn dir_store_lists_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.o"), scheduler_image()).unwrap();
        fs::write(dir.path().join("a.o"), scheduler_image()).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let names: Vec<String> = DirModuleStore::new(dir.path())
            .list()
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["a.o", "b.o"]);
    }

    #[test]
    fn static_store_resolves_only_installed_names() {
        let store = StaticModuleStore::new(["fifo", "lottery"]);
        assert_eq!(store.resolve("fifo").unwrap(), ModuleId::new("fifo", "fifo"));
        assert!(matches!(store.resolve("rr"), Err(ModuleError::NotFound(_))));
        assert_eq!(store.list().unwrap().len(), 2);
    }
}
