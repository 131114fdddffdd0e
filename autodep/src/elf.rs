//! ELF-aware probing (§4.C): when a job `exec`s or `dlopen`s a dynamically
//! linked executable, the kernel/dynamic-linker walks `DT_NEEDED`/`DT_RPATH`/
//! `DT_RUNPATH` to find shared libraries — a set of filesystem probes that
//! is no longer observable once the process has actually started, since the
//! loader does this work in-process before `main` runs. We parse the ELF
//! dynamic table ourselves (without loading/executing the file) so those
//! probes can be declared as deps up front.
//!
//! Only 64-bit little-endian ELF is handled; anything else is reported as
//! `None` needed-library info (the caller falls back to treating the
//! executable as an opaque dep with no transitive library deps, which is
//! conservative but never wrong — it just under-reports deps that a
//! non-autodep build would miss too).

const ELFMAG: &[u8; 4] = b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_LOAD: u32 = 1;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;

/// What the dynamic table said this ELF file needs, before any path
/// resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DynamicDigest {
    pub needed: Vec<String>,
    pub rpath: Option<String>,
    pub runpath: Option<String>,
}

struct ProgramHeader {
    p_type: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
}

fn read_u16(b: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(off..off + 2)?.try_into().ok()?))
}

fn read_u32(b: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(off..off + 4)?.try_into().ok()?))
}

fn read_u64(b: &[u8], off: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(off..off + 8)?.try_into().ok()?))
}

/// Translates a virtual address from the dynamic table into a file offset
/// by finding the `PT_LOAD` segment that contains it.
fn vaddr_to_offset(loads: &[ProgramHeader], vaddr: u64) -> Option<u64> {
    loads
        .iter()
        .filter(|p| p.p_type == PT_LOAD)
        .find(|p| vaddr >= p.p_vaddr && vaddr < p.p_vaddr + p.p_filesz)
        .map(|p| p.p_offset + (vaddr - p.p_vaddr))
}

fn read_cstr(bytes: &[u8], offset: usize) -> Option<String> {
    let end = bytes[offset..].iter().position(|&b| b == 0)? + offset;
    std::str::from_utf8(&bytes[offset..end]).ok().map(|s| s.to_string())
}

/// Parses the dynamic table of a 64-bit little-endian ELF file's raw bytes.
/// Returns `None` for non-ELF, non-64-bit, non-LE, or statically-linked
/// (no `PT_DYNAMIC`) input — all of which mean "nothing to probe".
pub fn parse_dynamic_table(bytes: &[u8]) -> Option<DynamicDigest> {
    if bytes.len() < 64 || &bytes[0..4] != ELFMAG {
        return None;
    }
    if bytes[4] != ELFCLASS64 || bytes[5] != ELFDATA2LSB {
        return None;
    }
    let e_phoff = read_u64(bytes, 32)? as usize;
    let e_phentsize = read_u16(bytes, 54)? as usize;
    let e_phnum = read_u16(bytes, 56)? as usize;

    let mut headers = Vec::with_capacity(e_phnum);
    for i in 0..e_phnum {
        let base = e_phoff + i * e_phentsize;
        let p_type = read_u32(bytes, base)?;
        let p_offset = read_u64(bytes, base + 8)?;
        let p_vaddr = read_u64(bytes, base + 16)?;
        let p_filesz = read_u64(bytes, base + 32)?;
        headers.push(ProgramHeader {
            p_type,
            p_offset,
            p_vaddr,
            p_filesz,
        });
    }

    let dynamic = headers.iter().find(|p| p.p_type == PT_DYNAMIC)?;
    let dyn_start = dynamic.p_offset as usize;
    let dyn_end = dyn_start + dynamic.p_filesz as usize;
    let dyn_bytes = bytes.get(dyn_start..dyn_end)?;

    // First pass: find DT_STRTAB so DT_NEEDED/DT_RPATH/DT_RUNPATH values
    // (string-table offsets) can be resolved.
    let mut strtab_vaddr = None;
    let mut entries = Vec::new();
    for chunk in dyn_bytes.chunks_exact(16) {
        let tag = u64::from_le_bytes(chunk[0..8].try_into().ok()?);
        let val = u64::from_le_bytes(chunk[8..16].try_into().ok()?);
        if tag == DT_NULL {
            break;
        }
        if tag == DT_STRTAB {
            strtab_vaddr = Some(val);
        }
        entries.push((tag, val));
    }
    let strtab_off = vaddr_to_offset(&headers, strtab_vaddr?)? as usize;

    let mut digest = DynamicDigest::default();
    for (tag, val) in entries {
        match tag {
            DT_NEEDED => {
                if let Some(name) = read_cstr(bytes, strtab_off + val as usize) {
                    digest.needed.push(name);
                }
            }
            DT_RPATH => digest.rpath = read_cstr(bytes, strtab_off + val as usize),
            DT_RUNPATH => digest.runpath = read_cstr(bytes, strtab_off + val as usize),
            _ => {}
        }
    }
    // DT_RPATH is ignored when DT_RUNPATH is present (original_source
    // src/autodep/ld.x.cc: "DT_RPATH is not used if DT_RUNPATH is present").
    if digest.runpath.is_some() {
        digest.rpath = None;
    }
    Some(digest)
}

/// One candidate location considered while resolving a `DT_NEEDED` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub path: String,
    /// True if the candidate file was found to exist — a `Reg` dep;
    /// otherwise just the directory probe counts as a `Lnk`-style dep
    /// (§4.C: "declaring each candidate as a `Lnk` dep and each existing
    /// file as a `Reg` dep").
    pub exists: bool,
}

/// Expands `$ORIGIN` to the directory containing `exe`, matching the
/// dynamic linker's own substitution rule.
pub fn expand_origin(value: &str, exe_dir: &str) -> String {
    value.replace("$ORIGIN", exe_dir).replace("${ORIGIN}", exe_dir)
}

/// Builds the ordered list of directories to search for `needed`, per the
/// dynamic linker's precedence: `rpath` (DT_RPATH, only if no DT_RUNPATH),
/// then `LD_LIBRARY_PATH`, then `runpath` (DT_RUNPATH), then a fixed
/// default set (§4.C).
pub fn search_dirs(digest: &DynamicDigest, ld_library_path: &str, default_dirs: &[&str]) -> Vec<String> {
    let mut dirs = Vec::new();
    if let Some(rpath) = &digest.rpath {
        dirs.extend(rpath.split(':').filter(|s| !s.is_empty()).map(|s| s.to_string()));
    }
    dirs.extend(ld_library_path.split(':').filter(|s| !s.is_empty()).map(|s| s.to_string()));
    if let Some(runpath) = &digest.runpath {
        dirs.extend(runpath.split(':').filter(|s| !s.is_empty()).map(|s| s.to_string()));
    }
    dirs.extend(default_dirs.iter().map(|s| s.to_string()));
    dirs
}

/// Walks `search_dirs` for each `DT_NEEDED` entry, probing with `exists`
/// (production code passes `Path::exists`; tests pass a fake set). Every
/// directory tried becomes a candidate; the first one found to exist wins
/// and later directories for that `needed` entry are not probed, matching
/// the dynamic linker's own first-match-wins resolution.
pub fn resolve_needed(
    digest: &DynamicDigest,
    ld_library_path: &str,
    default_dirs: &[&str],
    mut exists: impl FnMut(&str) -> bool,
) -> Vec<(String, Vec<Candidate>)> {
    let dirs = search_dirs(digest, ld_library_path, default_dirs);
    digest
        .needed
        .iter()
        .map(|needed| {
            let mut candidates = Vec::new();
            let mut found = false;
            for dir in &dirs {
                if found {
                    break;
                }
                let candidate_path = format!("{}/{}", dir.trim_end_matches('/'), needed);
                let candidate_exists = exists(&candidate_path);
                found = candidate_exists;
                candidates.push(Candidate {
                    path: candidate_path,
                    exists: candidate_exists,
                });
            }
            (needed.clone(), candidates)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal synthetic 64-bit ELF with a `PT_DYNAMIC` segment
    /// containing the given `DT_NEEDED`/`DT_RPATH`/`DT_RUNPATH` entries, for
    /// the ELF-parse round-trip law (§8).
    fn build_synthetic_elf(needed: &[&str], rpath: Option<&str>, runpath: Option<&str>) -> Vec<u8> {
        let mut strtab = vec![0u8]; // offset 0 is the empty string
        let mut str_offset = |s: &str, strtab: &mut Vec<u8>| -> u64 {
            let off = strtab.len() as u64;
            strtab.extend_from_slice(s.as_bytes());
            strtab.push(0);
            off
        };

        let mut dyn_entries: Vec<(u64, u64)> = Vec::new();
        for n in needed {
            let off = str_offset(n, &mut strtab);
            dyn_entries.push((DT_NEEDED, off));
        }
        if let Some(r) = rpath {
            let off = str_offset(r, &mut strtab);
            dyn_entries.push((DT_RPATH, off));
        }
        if let Some(r) = runpath {
            let off = str_offset(r, &mut strtab);
            dyn_entries.push((DT_RUNPATH, off));
        }

        const EHDR_SIZE: u64 = 64;
        const PHDR_SIZE: u64 = 56;
        let phdr_off = EHDR_SIZE;
        let n_phdrs = 2u64; // PT_LOAD (covers everything) + PT_DYNAMIC
        let strtab_off = phdr_off + n_phdrs * PHDR_SIZE;
        let dynamic_off = strtab_off + strtab.len() as u64;
        dyn_entries.push((DT_STRTAB, strtab_off)); // vaddr == file offset (PT_LOAD vaddr=0)
        dyn_entries.push((DT_NULL, 0));
        let dynamic_size = dyn_entries.len() as u64 * 16;
        let total_size = dynamic_off + dynamic_size;

        let mut bytes = vec![0u8; total_size as usize];
        bytes[0..4].copy_from_slice(ELFMAG);
        bytes[4] = ELFCLASS64;
        bytes[5] = ELFDATA2LSB;
        bytes[32..40].copy_from_slice(&phdr_off.to_le_bytes());
        bytes[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        bytes[56..58].copy_from_slice(&(n_phdrs as u16).to_le_bytes());

        // PT_LOAD: vaddr 0 -> file offset 0, spans the whole file so every
        // vaddr used above resolves trivially.
        let load_base = phdr_off as usize;
        bytes[load_base..load_base + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        bytes[load_base + 8..load_base + 16].copy_from_slice(&0u64.to_le_bytes());
        bytes[load_base + 16..load_base + 24].copy_from_slice(&0u64.to_le_bytes());
        bytes[load_base + 32..load_base + 40].copy_from_slice(&total_size.to_le_bytes());

        let dynhdr_base = load_base + PHDR_SIZE as usize;
        bytes[dynhdr_base..dynhdr_base + 4].copy_from_slice(&PT_DYNAMIC.to_le_bytes());
        bytes[dynhdr_base + 8..dynhdr_base + 16].copy_from_slice(&dynamic_off.to_le_bytes());
        bytes[dynhdr_base + 16..dynhdr_base + 24].copy_from_slice(&dynamic_off.to_le_bytes());
        bytes[dynhdr_base + 32..dynhdr_base + 40].copy_from_slice(&dynamic_size.to_le_bytes());

        bytes[strtab_off as usize..strtab_off as usize + strtab.len()].copy_from_slice(&strtab);

        for (i, (tag, val)) in dyn_entries.iter().enumerate() {
            let base = dynamic_off as usize + i * 16;
            bytes[base..base + 8].copy_from_slice(&tag.to_le_bytes());
            bytes[base + 8..base + 16].copy_from_slice(&val.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn parse_round_trips_needed_rpath_runpath() {
        let bytes = build_synthetic_elf(&["libc.so.6", "libm.so.6"], Some("/opt/lib"), None);
        let digest = parse_dynamic_table(&bytes).unwrap();
        assert_eq!(digest.needed, vec!["libc.so.6", "libm.so.6"]);
        assert_eq!(digest.rpath.as_deref(), Some("/opt/lib"));
        assert_eq!(digest.runpath, None);
    }

    #[test]
    fn runpath_present_suppresses_rpath() {
        let bytes = build_synthetic_elf(&["libc.so.6"], Some("/opt/old"), Some("/opt/new"));
        let digest = parse_dynamic_table(&bytes).unwrap();
        assert_eq!(digest.rpath, None);
        assert_eq!(digest.runpath.as_deref(), Some("/opt/new"));
    }

    #[test]
    fn non_elf_input_returns_none() {
        assert!(parse_dynamic_table(b"not an elf file").is_none());
    }

    #[test]
    fn statically_linked_binary_has_no_dynamic_segment() {
        // An ELF header with no PT_DYNAMIC program header at all.
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(ELFMAG);
        bytes[4] = ELFCLASS64;
        bytes[5] = ELFDATA2LSB;
        assert!(parse_dynamic_table(&bytes).is_none());
    }

    #[test]
    fn origin_expansion_substitutes_exe_dir() {
        assert_eq!(expand_origin("$ORIGIN/../lib", "/repo/bin"), "/repo/bin/../lib");
    }

    #[test]
    fn search_order_is_rpath_then_ld_library_path_then_runpath_then_defaults() {
        let digest = DynamicDigest {
            needed: vec![],
            rpath: Some("/rpath".to_string()),
            runpath: None,
        };
        let dirs = search_dirs(&digest, "/llp", &["/usr/lib"]);
        assert_eq!(dirs, vec!["/rpath", "/llp", "/usr/lib"]);
    }

    #[test]
    fn resolve_needed_declares_tried_and_found_candidates() {
        let digest = DynamicDigest {
            needed: vec!["libfoo.so".to_string()],
            rpath: None,
            runpath: None,
        };
        let existing = std::collections::HashSet::from(["/usr/lib/libfoo.so".to_string()]);
        let resolved = resolve_needed(&digest, "", &["/opt/lib", "/usr/lib"], |p| existing.contains(p));
        let (name, candidates) = &resolved[0];
        assert_eq!(name, "libfoo.so");
        assert_eq!(candidates.len(), 2);
        assert!(!candidates[0].exists);
        assert!(candidates[1].exists);
    }
}
