pub mod auth;
pub mod image;
pub mod imagen_api;

pub use auth::Credentials;
pub use image::GeneratedImage;
pub use imagen_api::{
    AspectRatio, Generated, ImageModel, ImageRequest, ImagenClient, ImagenClientConfig,
    ImagenError, Result, SafetySetting,
};
