// build.rs
// Compiles the demo's GLSL shaders to SPIR-V with glslc

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const STAGES: [&str; 2] = ["vert", "frag"];

/// glslc from the Vulkan SDK, falling back to the one on PATH
fn find_glslc() -> Option<PathBuf> {
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    if let Ok(sdk) = env::var("VULKAN_SDK") {
        let exe = if cfg!(target_os = "windows") { "glslc.exe" } else { "glslc" };
        let dir = if cfg!(target_os = "windows") { "Bin" } else { "bin" };
        let path = Path::new(&sdk).join(dir).join(exe);
        if path.exists() {
            return Some(path);
        }
        println!("cargo:warning=glslc not found at {}", path.display());
    }
    match Command::new("glslc").arg("--version").output() {
        Ok(output) if output.status.success() => Some(PathBuf::from("glslc")),
        _ => None,
    }
}

/// Newer source than output, or no output yet
fn needs_compile(src: &Path, dst: &Path) -> bool {
    match (std::fs::metadata(src).and_then(|m| m.modified()), std::fs::metadata(dst).and_then(|m| m.modified())) {
        (Ok(src_time), Ok(dst_time)) => src_time > dst_time,
        _ => true,
    }
}

fn main() {
    let shader_dir = PathBuf::from("shaders");
    println!("cargo:rerun-if-changed={}", shader_dir.display());

    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => PathBuf::from(dir).join("shaders"),
        Err(_) => return,
    };
    // Shader lookup directory baked into the binary
    println!("cargo:rustc-env=LUMEN_SHADER_DIR={}", out_dir.display());

    if env::var("SKIP_SHADERS").is_ok() {
        println!("cargo:warning=SKIP_SHADERS set, shader compilation skipped");
        return;
    }
    let Some(glslc) = find_glslc() else {
        println!("cargo:warning=glslc not found (install the Vulkan SDK or put glslc on PATH); shaders not compiled");
        return;
    };
    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        println!("cargo:warning=failed to create {}: {e}", out_dir.display());
        return;
    }

    let entries = match std::fs::read_dir(&shader_dir) {
        Ok(entries) => entries,
        Err(e) => {
            println!("cargo:warning=no shader directory at {}: {e}", shader_dir.display());
            return;
        }
    };

    let mut compiled = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_stage = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| STAGES.contains(&ext));
        if !is_stage {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        // simple_shader.vert -> simple_shader.vert.spv
        let out_file = out_dir.join(format!("{file_name}.spv"));
        if !needs_compile(&path, &out_file) {
            continue;
        }

        let status = Command::new(&glslc)
            .arg(&path)
            .arg("-o")
            .arg(&out_file)
            .status();
        match status {
            Ok(s) if s.success() => compiled += 1,
            Ok(s) => panic!("glslc failed for {} with exit code {}", path.display(), s.code().unwrap_or(-1)),
            Err(e) => panic!("failed to run glslc for {}: {e}", path.display()),
        }
    }
    if compiled > 0 {
        eprintln!("info: compiled {compiled} shader(s) into {}", out_dir.display());
    }
}
