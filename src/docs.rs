use crate::modules::video::dto::{
    CancelJobResponse, EstimatedCompletion, JobListResponse, JobStatusResponse,
    UploadAcceptedResponse,
};
use crate::modules::video::model::{JobStatus, Quality};
use utoipa::Modify;
use utoipa::OpenApi;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::video::handler::upload_video,
        crate::modules::video::handler::get_job_status,
        crate::modules::video::handler::list_jobs,
        crate::modules::video::handler::cancel_job,
        crate::modules::video::stream_handler::stream_video,
    ),
    components(
        schemas(
            Quality, JobStatus, EstimatedCompletion, UploadAcceptedResponse,
            JobStatusResponse, JobListResponse, CancelJobResponse,
        )
    ),
    tags(
        (name = "Video", description = "Lesson video ingestion, transcoding and streaming")
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
