// 构建脚本: 启用 ffmpeg 功能时链接 FFmpeg 静态库的系统依赖
fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_FFMPEG");
    if std::env::var_os("CARGO_FEATURE_FFMPEG").is_none() {
        return;
    }

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_env = std::env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();

    // Windows MSVC: dshow 采集与 vcpkg 静态 FFmpeg 需要的系统库
    if target_os == "windows" && target_env == "msvc" {
        for lib in ["oleaut32", "vfw32", "secur32", "strmiids"] {
            println!("cargo:rustc-link-lib=dylib={}", lib);
        }
    }
}
