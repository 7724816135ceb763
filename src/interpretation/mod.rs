//! Diagnostic saliency maps for image-consuming models.

pub mod gradcam;

pub use gradcam::{grad_cam, render_overlay, GradCamMap};
