fn main() {
    slint_build::compile("ui/board.slint").expect("failed to compile board.slint");
    println!("cargo:rerun-if-changed=ui/board.slint");
}
